use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::client::EngineCtx;
use crate::error::NegotiationError;
use crate::negotiation::{
    random_handshake_id, spawn_candidate_forwarder, watch_session, PendingCandidates,
};
use crate::registry::{AttemptRecord, AttemptRole, BeginVeto, Session};
use crate::router::{RoutedSignal, SignalKind};
use crate::transport::{PeerTransport, TransportEvent, TransportState};
use berth_proto::{OfferPayload, SignalFrame};

/// Outcome of one outgoing negotiation attempt.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Success {
        peer_id: String,
        /// Metadata the peer attached to its answer.
        peer_metadata: Option<Value>,
        /// Total offer rounds, ICE restarts included.
        attempts: u32,
        session: Session,
    },
    Error {
        peer_id: String,
        error: NegotiationError,
        peer_metadata: Option<Value>,
        /// Populated on `PEER_ALREADY_CONNECTED` vetoes.
        existing: Option<Session>,
    },
}

#[derive(Default)]
struct AttemptSlot {
    handshake_id: Option<String>,
    ice_restarts: u32,
}

struct BrokerInner {
    ctx: Arc<EngineCtx>,
    peer_id: String,
    metadata: Option<Value>,
    vetoed: bool,
    attempt: AsyncMutex<AttemptSlot>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
}

/// The reusable trigger returned by `PeerClient::broker`. Wire it to the
/// transport's negotiation-needed signal; each `negotiate` call runs one
/// offer/answer/candidate exchange, restarting internally within the
/// configured ICE-restart budget.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<BrokerInner>,
}

impl BrokerHandle {
    pub(crate) fn new(ctx: Arc<EngineCtx>, peer_id: String, metadata: Option<Value>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut vetoed = false;
        if let Err(veto) = ctx.registry.begin(&peer_id) {
            vetoed = true;
            let (error, existing) = match veto {
                BeginVeto::Ongoing => (
                    NegotiationError::Ongoing {
                        peer_id: peer_id.clone(),
                    },
                    None,
                ),
                BeginVeto::AlreadyConnected(session) => (
                    NegotiationError::AlreadyConnected {
                        peer_id: peer_id.clone(),
                    },
                    Some(session),
                ),
            };
            tracing::warn!(
                target = "signaling",
                peer_id = %peer_id,
                code = %error.code(),
                "broker refused"
            );
            let _ = events_tx.send(BrokerEvent::Error {
                peer_id: peer_id.clone(),
                error,
                peer_metadata: None,
                existing,
            });
        }
        Self {
            inner: Arc::new(BrokerInner {
                ctx,
                peer_id,
                metadata,
                vetoed,
                attempt: AsyncMutex::new(AttemptSlot::default()),
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Take the event stream. Yields the veto error immediately for a
    /// refused broker; otherwise one terminal event per attempt.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<BrokerEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    /// Run negotiation rounds against the supplied transport until the
    /// attempt terminates. Invocations on the same handle serialize.
    pub async fn negotiate(&self, transport: Arc<dyn PeerTransport>) {
        let inner = &self.inner;
        if inner.vetoed {
            tracing::debug!(
                target = "signaling",
                peer_id = %inner.peer_id,
                "closing transport handed to a refused broker"
            );
            transport.close().await;
            return;
        }

        let mut slot = inner.attempt.lock().await;
        if slot.handshake_id.is_none() {
            let handshake_id = random_handshake_id();
            inner.ctx.registry.insert_attempt(AttemptRecord {
                handshake_id: handshake_id.clone(),
                peer_id: inner.peer_id.clone(),
                role: AttemptRole::Outgoing,
                ice_restarts: 0,
            });
            slot.handshake_id = Some(handshake_id);
            slot.ice_restarts = 0;
        }

        loop {
            let handshake_id = slot
                .handshake_id
                .clone()
                .unwrap_or_else(random_handshake_id);
            let round = slot.ice_restarts + 1;
            match run_round(inner, &transport, &handshake_id, round).await {
                RoundOutcome::Connected { peer_metadata } => {
                    let session = Session {
                        peer_id: inner.peer_id.clone(),
                        transport: Arc::clone(&transport),
                    };
                    inner.ctx.registry.commit(session.clone());
                    if inner.ctx.registry.enabled() {
                        let _ = watch_session(Arc::clone(&inner.ctx.registry), session.clone());
                    }
                    inner.ctx.registry.remove_attempt(&handshake_id);
                    tracing::info!(
                        target = "signaling",
                        peer_id = %inner.peer_id,
                        attempts = round,
                        "negotiation succeeded"
                    );
                    let _ = inner.events_tx.send(BrokerEvent::Success {
                        peer_id: inner.peer_id.clone(),
                        peer_metadata,
                        attempts: round,
                        session,
                    });
                    *slot = AttemptSlot::default();
                    return;
                }
                RoundOutcome::Restart => {
                    slot.ice_restarts += 1;
                    inner.ctx.registry.bump_restarts(&handshake_id);
                    tracing::warn!(
                        target = "signaling",
                        peer_id = %inner.peer_id,
                        restarts = slot.ice_restarts,
                        "restarting negotiation"
                    );
                    if let Err(err) = transport.restart_negotiation().await {
                        let error = NegotiationError::transport(&inner.peer_id, err);
                        terminal_failure(inner, &mut slot, &transport, &handshake_id, error, None)
                            .await;
                        return;
                    }
                }
                RoundOutcome::Fatal {
                    error,
                    peer_metadata,
                } => {
                    terminal_failure(
                        inner,
                        &mut slot,
                        &transport,
                        &handshake_id,
                        error,
                        peer_metadata,
                    )
                    .await;
                    return;
                }
            }
        }
    }
}

enum RoundOutcome {
    Connected { peer_metadata: Option<Value> },
    Restart,
    Fatal {
        error: NegotiationError,
        peer_metadata: Option<Value>,
    },
}

async fn run_round(
    inner: &BrokerInner,
    transport: &Arc<dyn PeerTransport>,
    handshake_id: &str,
    round: u32,
) -> RoundOutcome {
    let ctx = &inner.ctx;
    let peer_id = inner.peer_id.clone();

    if let Err(err) = ctx.link.ensure_connection().await {
        return RoundOutcome::Fatal {
            error: NegotiationError::Link(err),
            peer_metadata: None,
        };
    }

    let cancel = CancellationToken::new();
    let (route_guard, mut signals) = ctx
        .router
        .subscribe(&[SignalKind::Answer, SignalKind::Candidate], handshake_id);
    let forwarder = spawn_candidate_forwarder(
        ctx.link.clone(),
        transport.events(),
        cancel.child_token(),
        peer_id.clone(),
        handshake_id.to_string(),
    );
    let mut transport_events = transport.events();
    let mut pending = PendingCandidates::new(Arc::clone(transport));
    let mut got_remote = false;
    let mut peer_metadata: Option<Value> = None;

    let outcome = 'round: {
        let local = match transport.set_local_description().await {
            Ok(desc) => desc,
            Err(err) => {
                break 'round RoundOutcome::Fatal {
                    error: NegotiationError::transport(&peer_id, err),
                    peer_metadata: None,
                }
            }
        };
        let frame = SignalFrame::offer(
            peer_id.clone(),
            OfferPayload {
                sdp: local,
                handshake_id: handshake_id.to_string(),
                metadata: inner.metadata.clone(),
                attempt: round,
            },
        );
        if let Err(err) = ctx.link.send(frame) {
            break 'round RoundOutcome::Fatal {
                error: NegotiationError::Link(err),
                peer_metadata: None,
            };
        }
        tracing::info!(
            target = "signaling",
            peer_id = %peer_id,
            handshake_id = %handshake_id,
            attempt = round,
            "offer sent"
        );

        let deadline = sleep(ctx.config.per_attempt_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let at_deadline = if !got_remote {
                        // No answer at all: the peer is presumed
                        // unreachable, so the restart budget stays whole.
                        RoundOutcome::Fatal {
                            error: NegotiationError::Timeout { peer_id: peer_id.clone(), attempts: round },
                            peer_metadata: peer_metadata.clone(),
                        }
                    } else if round <= ctx.config.max_ice_restarts {
                        RoundOutcome::Restart
                    } else {
                        RoundOutcome::Fatal {
                            error: NegotiationError::Failed { peer_id: peer_id.clone(), attempts: round },
                            peer_metadata: peer_metadata.clone(),
                        }
                    };
                    break 'round at_deadline;
                }
                signal = signals.recv() => match signal {
                    Some(RoutedSignal::Answer { payload, .. }) => {
                        if let Some(metadata) = payload.metadata {
                            peer_metadata = Some(metadata);
                        }
                        if payload.rejected {
                            break 'round RoundOutcome::Fatal {
                                error: NegotiationError::Rejected { peer_id: peer_id.clone() },
                                peer_metadata: peer_metadata.clone(),
                            };
                        }
                        let Some(sdp) = payload.sdp else {
                            tracing::warn!(
                                target = "signaling",
                                peer_id = %peer_id,
                                "answer without sdp or rejection flag"
                            );
                            continue;
                        };
                        if let Err(err) = transport.set_remote_description(sdp).await {
                            break 'round RoundOutcome::Fatal {
                                error: NegotiationError::transport(&peer_id, err),
                                peer_metadata: peer_metadata.clone(),
                            };
                        }
                        got_remote = true;
                        if let Err(err) = pending.flush().await {
                            tracing::warn!(
                                target = "signaling",
                                peer_id = %peer_id,
                                error = %err,
                                "failed to apply queued candidate"
                            );
                        }
                        tracing::debug!(
                            target = "signaling",
                            peer_id = %peer_id,
                            "remote description applied"
                        );
                    }
                    Some(RoutedSignal::Candidate { payload, .. }) => {
                        if let Err(err) = pending.push(payload.candidate).await {
                            tracing::warn!(
                                target = "signaling",
                                peer_id = %peer_id,
                                error = %err,
                                "failed to apply candidate"
                            );
                        }
                    }
                    None => break 'round RoundOutcome::Fatal {
                        error: NegotiationError::Transport {
                            peer_id: peer_id.clone(),
                            message: "signal route closed".to_string(),
                        },
                        peer_metadata: peer_metadata.clone(),
                    },
                },
                event = transport_events.recv() => match event {
                    Ok(TransportEvent::StateChanged(TransportState::Connected)) => {
                        break 'round RoundOutcome::Connected { peer_metadata: peer_metadata.clone() };
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break 'round RoundOutcome::Fatal {
                            error: NegotiationError::Transport {
                                peer_id: peer_id.clone(),
                                message: "transport event stream closed".to_string(),
                            },
                            peer_metadata: peer_metadata.clone(),
                        };
                    }
                },
            }
        }
    };

    // Detach everything belonging to this round before the caller acts;
    // a restart round must never hear this round's events.
    cancel.cancel();
    forwarder.abort();
    drop(route_guard);
    outcome
}

async fn terminal_failure(
    inner: &BrokerInner,
    slot: &mut AttemptSlot,
    transport: &Arc<dyn PeerTransport>,
    handshake_id: &str,
    error: NegotiationError,
    peer_metadata: Option<Value>,
) {
    inner.ctx.registry.remove_attempt(handshake_id);
    inner.ctx.registry.release(&inner.peer_id);
    transport.close().await;
    tracing::warn!(
        target = "signaling",
        peer_id = %inner.peer_id,
        code = %error.code(),
        error = %error,
        "negotiation failed"
    );
    let _ = inner.events_tx.send(BrokerEvent::Error {
        peer_id: inner.peer_id.clone(),
        error,
        peer_metadata,
        existing: None,
    });
    *slot = AttemptSlot::default();
}
