//! Answer-side negotiation: the accept/reject decision protocol and the
//! per-offer state machine. At most one live handler per peer; a newer
//! offer from the same peer supersedes the pending one.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientEvent, EngineCtx, IncomingOffer};
use crate::error::NegotiationError;
use crate::negotiation::{spawn_candidate_forwarder, watch_session, PendingCandidates};
use crate::registry::{AttemptRecord, AttemptRole, Session};
use crate::router::{InboundOffer, RoutedSignal, SignalKind};
use crate::transport::{TransportEvent, TransportState};
use berth_proto::{AnswerPayload, OfferPayload, SignalFrame};

struct LiveIncoming {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Consumes fresh offers from the router and keeps the one-handler-per
/// -peer invariant.
pub(crate) async fn run_offer_dispatcher(
    ctx: Arc<EngineCtx>,
    mut offers: mpsc::UnboundedReceiver<InboundOffer>,
) {
    let mut live: HashMap<String, LiveIncoming> = HashMap::new();
    while let Some(offer) = offers.recv().await {
        live.retain(|_, handler| !handler.task.is_finished());
        let peer_id = offer.src.clone();

        if ctx.registry.enabled() && ctx.registry.session(&peer_id).is_some() {
            tracing::debug!(
                target = "signaling",
                peer_id = %peer_id,
                "rejecting offer, already connected"
            );
            send_rejection(
                &ctx,
                &peer_id,
                &offer.payload.handshake_id,
                Some(json!({"alreadyConnected": true})),
            );
            continue;
        }

        if let Some(stale) = live.remove(&peer_id) {
            tracing::warn!(
                target = "signaling",
                peer_id = %peer_id,
                "offer retry before resolution, aborting previous attempt"
            );
            stale.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_incoming(Arc::clone(&ctx), offer, cancel.clone()));
        live.insert(peer_id, LiveIncoming { cancel, task });
    }
}

fn send_rejection(ctx: &EngineCtx, peer_id: &str, handshake_id: &str, metadata: Option<Value>) {
    let frame = SignalFrame::answer(
        peer_id,
        AnswerPayload {
            sdp: None,
            rejected: true,
            handshake_id: handshake_id.to_string(),
            metadata,
        },
    );
    if ctx.link.send(frame).is_err() {
        tracing::debug!(
            target = "signaling",
            peer_id = %peer_id,
            "could not send rejection, link not open"
        );
    }
}

async fn run_incoming(ctx: Arc<EngineCtx>, offer: InboundOffer, cancel: CancellationToken) {
    let InboundOffer { src: peer_id, payload } = offer;
    let handshake_id = payload.handshake_id.clone();
    tracing::info!(
        target = "signaling",
        peer_id = %peer_id,
        handshake_id = %handshake_id,
        attempt = payload.attempt,
        "incoming offer"
    );

    let (granted, metadata) = match decide(&ctx, &peer_id, &payload, &cancel).await {
        Some(decision) => decision,
        None => return, // superseded while deciding
    };

    if !granted {
        tracing::debug!(target = "signaling", peer_id = %peer_id, "offer rejected");
        send_rejection(&ctx, &peer_id, &handshake_id, metadata);
        return;
    }

    let transport = match ctx.factory.create() {
        Ok(transport) => transport,
        Err(err) => {
            let error = NegotiationError::transport(&peer_id, err);
            emit_failed(&ctx, &peer_id, payload, error);
            return;
        }
    };

    ctx.registry.insert_attempt(AttemptRecord {
        handshake_id: handshake_id.clone(),
        peer_id: peer_id.clone(),
        role: AttemptRole::Incoming,
        ice_restarts: 0,
    });

    let (route_guard, mut signals) = ctx
        .router
        .subscribe(&[SignalKind::Candidate], &handshake_id);
    let forwarder = spawn_candidate_forwarder(
        ctx.link.clone(),
        transport.events(),
        cancel.child_token(),
        peer_id.clone(),
        handshake_id.clone(),
    );
    let mut transport_events = transport.events();
    let mut pending = PendingCandidates::new(Arc::clone(&transport));

    // Offer in, answer out.
    if let Err(err) = transport.set_remote_description(payload.sdp.clone()).await {
        cleanup(&ctx, &handshake_id, route_guard, forwarder);
        transport.close().await;
        emit_failed(&ctx, &peer_id, payload, NegotiationError::transport(&peer_id, err));
        return;
    }
    if let Err(err) = pending.flush().await {
        tracing::warn!(target = "signaling", error = %err, "failed to apply queued candidate");
    }
    let answer = match transport.set_local_description().await {
        Ok(desc) => desc,
        Err(err) => {
            cleanup(&ctx, &handshake_id, route_guard, forwarder);
            transport.close().await;
            emit_failed(&ctx, &peer_id, payload, NegotiationError::transport(&peer_id, err));
            return;
        }
    };
    let answer_frame = SignalFrame::answer(
        peer_id.clone(),
        AnswerPayload {
            sdp: Some(answer),
            rejected: false,
            handshake_id: handshake_id.clone(),
            metadata,
        },
    );
    if let Err(err) = ctx.link.send(answer_frame) {
        cleanup(&ctx, &handshake_id, route_guard, forwarder);
        transport.close().await;
        emit_failed(&ctx, &peer_id, payload, NegotiationError::Link(err));
        return;
    }
    tracing::info!(
        target = "signaling",
        peer_id = %peer_id,
        handshake_id = %handshake_id,
        "answer sent"
    );

    let deadline = sleep(ctx.config.incoming_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Superseded by a retry offer; the replacement proceeds.
                cleanup(&ctx, &handshake_id, route_guard, forwarder);
                transport.close().await;
                return;
            }
            _ = &mut deadline => {
                let error = NegotiationError::Timeout {
                    peer_id: peer_id.clone(),
                    attempts: payload.attempt,
                };
                cleanup(&ctx, &handshake_id, route_guard, forwarder);
                transport.close().await;
                emit_failed(&ctx, &peer_id, payload, error);
                return;
            }
            signal = signals.recv() => match signal {
                Some(RoutedSignal::Candidate { payload: candidate, .. }) => {
                    if let Err(err) = pending.push(candidate.candidate).await {
                        tracing::warn!(
                            target = "signaling",
                            peer_id = %peer_id,
                            error = %err,
                            "failed to apply candidate"
                        );
                    }
                }
                Some(RoutedSignal::Answer { .. }) => {}
                None => {
                    let error = NegotiationError::Transport {
                        peer_id: peer_id.clone(),
                        message: "signal route closed".to_string(),
                    };
                    cleanup(&ctx, &handshake_id, route_guard, forwarder);
                    transport.close().await;
                    emit_failed(&ctx, &peer_id, payload, error);
                    return;
                }
            },
            event = transport_events.recv() => match event {
                Ok(TransportEvent::StateChanged(TransportState::Connected)) => {
                    let session = Session {
                        peer_id: peer_id.clone(),
                        transport: Arc::clone(&transport),
                    };
                    ctx.registry.commit(session.clone());
                    if ctx.registry.enabled() {
                        let _ = watch_session(Arc::clone(&ctx.registry), session.clone());
                    }
                    cleanup(&ctx, &handshake_id, route_guard, forwarder);
                    tracing::info!(
                        target = "signaling",
                        peer_id = %peer_id,
                        "incoming connection established"
                    );
                    let _ = ctx.events_tx.send(ClientEvent::Connection {
                        peer_id,
                        payload,
                        session,
                    });
                    return;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    let error = NegotiationError::Transport {
                        peer_id: peer_id.clone(),
                        message: "transport event stream closed".to_string(),
                    };
                    cleanup(&ctx, &handshake_id, route_guard, forwarder);
                    transport.close().await;
                    emit_failed(&ctx, &peer_id, payload, error);
                    return;
                }
            },
        }
    }
}

/// Ask the registered observer, or fall back to the configured default.
/// `None` means the attempt was superseded mid-decision.
async fn decide(
    ctx: &Arc<EngineCtx>,
    peer_id: &str,
    payload: &OfferPayload,
    cancel: &CancellationToken,
) -> Option<(bool, Option<Value>)> {
    let default_metadata = ctx.config.default_metadata_for_incoming.clone();
    if !ctx.incoming_observed.load(Ordering::SeqCst) {
        // Nobody is listening for incoming offers: auto-accept.
        return Some((true, default_metadata));
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let event = IncomingOffer {
        peer_id: peer_id.to_string(),
        payload: payload.clone(),
        reply: reply_tx,
    };
    if ctx.incoming_tx.send(event).is_err() {
        // Observer receiver dropped; treat like an unanswered prompt.
        return Some((false, default_metadata));
    }

    tokio::select! {
        _ = cancel.cancelled() => None,
        decision = timeout(ctx.config.accept_timeout, reply_rx) => match decision {
            Ok(Ok((granted, metadata))) => Some((granted, metadata.or(default_metadata))),
            _ => {
                tracing::warn!(
                    target = "signaling",
                    peer_id = %peer_id,
                    "incoming offer unanswered, rejecting"
                );
                Some((false, default_metadata))
            }
        },
    }
}

fn cleanup(
    ctx: &Arc<EngineCtx>,
    handshake_id: &str,
    route_guard: crate::router::RouteGuard,
    forwarder: JoinHandle<()>,
) {
    forwarder.abort();
    drop(route_guard);
    ctx.registry.remove_attempt(handshake_id);
}

fn emit_failed(ctx: &Arc<EngineCtx>, peer_id: &str, payload: OfferPayload, error: NegotiationError) {
    tracing::warn!(
        target = "signaling",
        peer_id = %peer_id,
        code = %error.code(),
        error = %error,
        "incoming negotiation failed"
    );
    let _ = ctx.events_tx.send(ClientEvent::FailedConnection {
        peer_id: peer_id.to_string(),
        payload,
        error,
    });
}
