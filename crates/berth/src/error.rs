use std::fmt;
use thiserror::Error;

/// Machine-readable codes carried by every terminal failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SignallingServerConnection,
    SignallingServerPeerIdTaken,
    PeerConnectionTimeout,
    PeerConnectionFailed,
    PeerConnectionRejected,
    PeerConnectionOngoing,
    PeerAlreadyConnected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SignallingServerConnection => "SIGNALLING_SERVER_CONNECTION",
            ErrorCode::SignallingServerPeerIdTaken => "SIGNALLING_SERVER_PEERID_TAKEN",
            ErrorCode::PeerConnectionTimeout => "PEER_CONNECTION_TIMEOUT",
            ErrorCode::PeerConnectionFailed => "PEER_CONNECTION_FAILED",
            ErrorCode::PeerConnectionRejected => "PEER_CONNECTION_REJECTED",
            ErrorCode::PeerConnectionOngoing => "PEER_CONNECTION_ONGOING",
            ErrorCode::PeerAlreadyConnected => "PEER_ALREADY_CONNECTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the control channel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("signalling server connection could not be established after {attempts} attempt(s)")]
    ServerConnection { attempts: u32 },
    #[error("signalling server link lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("peer id '{peer_id}' is already taken on the signalling server")]
    PeerIdTaken { peer_id: String },
    #[error("invalid signalling endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },
    #[error("signalling link is not open")]
    NotOpen,
}

impl LinkError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LinkError::PeerIdTaken { .. } => ErrorCode::SignallingServerPeerIdTaken,
            _ => ErrorCode::SignallingServerConnection,
        }
    }
}

/// Failures reported by the externally supplied transport collaborator.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Failures scoped to a single negotiation attempt. Never affects the
/// link or attempts for other peers.
#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("no answer from peer '{peer_id}' before the deadline ({attempts} attempt(s))")]
    Timeout { peer_id: String, attempts: u32 },
    #[error("connection to peer '{peer_id}' failed after {attempts} attempt(s)")]
    Failed { peer_id: String, attempts: u32 },
    #[error("peer '{peer_id}' rejected the connection")]
    Rejected { peer_id: String },
    #[error("a connection attempt to peer '{peer_id}' is already in progress")]
    Ongoing { peer_id: String },
    #[error("already connected to peer '{peer_id}'")]
    AlreadyConnected { peer_id: String },
    #[error("signalling link failed: {0}")]
    Link(#[from] LinkError),
    #[error("transport failure while negotiating with '{peer_id}': {message}")]
    Transport { peer_id: String, message: String },
}

impl NegotiationError {
    pub fn transport(peer_id: &str, err: TransportError) -> Self {
        NegotiationError::Transport {
            peer_id: peer_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            NegotiationError::Timeout { .. } => ErrorCode::PeerConnectionTimeout,
            NegotiationError::Failed { .. } => ErrorCode::PeerConnectionFailed,
            NegotiationError::Rejected { .. } => ErrorCode::PeerConnectionRejected,
            NegotiationError::Ongoing { .. } => ErrorCode::PeerConnectionOngoing,
            NegotiationError::AlreadyConnected { .. } => ErrorCode::PeerAlreadyConnected,
            NegotiationError::Link(link) => link.code(),
            NegotiationError::Transport { .. } => ErrorCode::PeerConnectionFailed,
        }
    }

    /// Total rounds run before the attempt terminated, where known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            NegotiationError::Timeout { attempts, .. }
            | NegotiationError::Failed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_strings() {
        assert_eq!(
            ErrorCode::SignallingServerConnection.as_str(),
            "SIGNALLING_SERVER_CONNECTION"
        );
        assert_eq!(
            ErrorCode::SignallingServerPeerIdTaken.as_str(),
            "SIGNALLING_SERVER_PEERID_TAKEN"
        );
        let timeout = NegotiationError::Timeout {
            peer_id: "bob".into(),
            attempts: 1,
        };
        assert_eq!(timeout.code(), ErrorCode::PeerConnectionTimeout);
        assert_eq!(timeout.attempts(), Some(1));
        let taken = NegotiationError::Link(LinkError::PeerIdTaken {
            peer_id: "bob".into(),
        });
        assert_eq!(taken.code(), ErrorCode::SignallingServerPeerIdTaken);
    }
}
