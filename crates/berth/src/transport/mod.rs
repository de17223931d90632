use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::TransportError;

pub use berth_proto::{IceCandidate, SessionDescription};

pub mod mock;

/// Connection states reported by the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A locally gathered candidate to relay to the remote peer.
    LocalCandidate(IceCandidate),
    /// The transport wants a fresh offer/answer round.
    NegotiationNeeded,
    DataChannelOpened { label: String },
}

/// The peer-to-peer session object, supplied externally. The engine
/// drives it through this surface and never implements it, inspects its
/// payloads, or assumes anything about its NAT traversal.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Generate and apply a local description: an offer when no remote
    /// description is set, an answer otherwise. Returns what was applied.
    async fn set_local_description(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Renegotiate a stalled session without discarding it (ICE restart).
    async fn restart_negotiation(&self) -> Result<(), TransportError>;

    fn connection_state(&self) -> TransportState;

    /// Subscribe to state changes, local candidates, and channel events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self);
}

/// Creates one transport per accepted incoming offer. Implementations
/// carry whatever configuration the underlying stack needs (ICE servers,
/// channel options); the engine never looks inside.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
