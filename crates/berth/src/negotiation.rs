//! Machinery shared by the outgoing broker and the incoming offer
//! handler: the early-candidate queue, the local-candidate forwarder,
//! and the session watcher that releases registry slots on transport
//! loss.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::link::SignalingLink;
use crate::registry::{AttemptRegistry, Session};
use crate::transport::{IceCandidate, PeerTransport, TransportEvent, TransportState};
use berth_proto::{CandidatePayload, SignalFrame};

/// Applies inbound candidates to the transport, buffering any that
/// arrive before the remote description. `flush` drains the buffer
/// exactly once; later candidates pass straight through.
pub(crate) struct PendingCandidates {
    transport: Arc<dyn PeerTransport>,
    queued: Option<Vec<IceCandidate>>,
}

impl PendingCandidates {
    pub(crate) fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            queued: Some(Vec::new()),
        }
    }

    pub(crate) async fn push(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        match self.queued.as_mut() {
            Some(queue) => {
                tracing::debug!(target = "signaling", "queueing candidate before remote description");
                queue.push(candidate);
                Ok(())
            }
            None => self.transport.add_ice_candidate(candidate).await,
        }
    }

    /// Call once the remote description has been applied.
    pub(crate) async fn flush(&mut self) -> Result<(), TransportError> {
        if let Some(queue) = self.queued.take() {
            for candidate in queue {
                self.transport.add_ice_candidate(candidate).await?;
            }
        }
        Ok(())
    }
}

/// Relay locally gathered candidates to the peer for as long as the
/// attempt lives; the token tears the task down with the attempt.
pub(crate) fn spawn_candidate_forwarder(
    link: SignalingLink,
    mut events: broadcast::Receiver<TransportEvent>,
    cancel: CancellationToken,
    peer_id: String,
    handshake_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(TransportEvent::LocalCandidate(candidate)) => {
                        let frame = SignalFrame::candidate(
                            peer_id.clone(),
                            CandidatePayload {
                                candidate,
                                handshake_id: handshake_id.clone(),
                            },
                        );
                        if link.send(frame).is_err() {
                            tracing::debug!(
                                target = "signaling",
                                peer_id = %peer_id,
                                "dropping local candidate, link not open"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target = "signaling",
                            skipped,
                            "candidate forwarder lagged behind transport events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

/// Watch a committed session and release its registry slot when the
/// transport reports disconnected/failed/closed.
pub(crate) fn watch_session(registry: Arc<AttemptRegistry>, session: Session) -> JoinHandle<()> {
    let mut events = session.transport.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::StateChanged(
                    TransportState::Disconnected | TransportState::Failed | TransportState::Closed,
                )) => {
                    registry.release(&session.peer_id);
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    registry.release(&session.peer_id);
                    break;
                }
            }
        }
    })
}

pub(crate) fn random_handshake_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
