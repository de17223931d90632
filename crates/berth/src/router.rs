use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use berth_proto::{AnswerPayload, CandidatePayload, OfferPayload, SignalFrame};

/// Frame kinds addressed to a specific live attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Answer,
    Candidate,
}

#[derive(Debug, Clone)]
pub enum RoutedSignal {
    Answer { src: String, payload: AnswerPayload },
    Candidate { src: String, payload: CandidatePayload },
}

/// A fresh offer, dispatched by peer id rather than handshake id.
#[derive(Debug, Clone)]
pub struct InboundOffer {
    pub src: String,
    pub payload: OfferPayload,
}

struct Waiter {
    tx: mpsc::UnboundedSender<RoutedSignal>,
    token: u64,
}

/// Dispatches inbound signaling frames to the one waiting attempt,
/// keyed by `(kind, handshake id)`. Unmatched answers/candidates are
/// dropped: the attempt already terminated.
pub struct Router {
    next_token: AtomicU64,
    waiters: Mutex<HashMap<(SignalKind, String), Waiter>>,
    offers_tx: mpsc::UnboundedSender<InboundOffer>,
}

impl Router {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<InboundOffer>) {
        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            next_token: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            offers_tx,
        });
        (router, offers_rx)
    }

    /// Register the single waiter for `handshake_id` on the given kinds.
    /// The returned guard unregisters on drop, so a cancelled attempt
    /// atomically stops receiving.
    pub fn subscribe(
        self: &Arc<Self>,
        kinds: &[SignalKind],
        handshake_id: &str,
    ) -> (RouteGuard, mpsc::UnboundedReceiver<RoutedSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut waiters = self.waiters.lock().unwrap();
        let mut keys = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let key = (*kind, handshake_id.to_string());
            if waiters
                .insert(
                    key.clone(),
                    Waiter {
                        tx: tx.clone(),
                        token,
                    },
                )
                .is_some()
            {
                tracing::warn!(
                    target = "signaling",
                    handshake_id = %handshake_id,
                    kind = ?kind,
                    "replacing existing signal subscription"
                );
            }
            keys.push(key);
        }
        drop(waiters);
        (
            RouteGuard {
                router: Arc::clone(self),
                keys,
                token,
            },
            rx,
        )
    }

    pub fn dispatch(&self, frame: SignalFrame) {
        match frame {
            SignalFrame::Offer {
                src: Some(src),
                payload,
                ..
            } => {
                let _ = self.offers_tx.send(InboundOffer { src, payload });
            }
            SignalFrame::Answer {
                src: Some(src),
                payload,
                ..
            } => {
                let handshake_id = payload.handshake_id.clone();
                self.route(
                    SignalKind::Answer,
                    handshake_id,
                    RoutedSignal::Answer { src, payload },
                );
            }
            SignalFrame::Candidate {
                src: Some(src),
                payload,
                ..
            } => {
                let handshake_id = payload.handshake_id.clone();
                self.route(
                    SignalKind::Candidate,
                    handshake_id,
                    RoutedSignal::Candidate { src, payload },
                );
            }
            other => {
                tracing::debug!(target = "signaling", frame = ?other, "dropping unroutable frame");
            }
        }
    }

    fn route(&self, kind: SignalKind, handshake_id: String, signal: RoutedSignal) {
        let waiters = self.waiters.lock().unwrap();
        match waiters.get(&(kind, handshake_id.clone())) {
            Some(waiter) if waiter.tx.send(signal).is_ok() => {}
            _ => {
                tracing::debug!(
                    target = "signaling",
                    handshake_id = %handshake_id,
                    kind = ?kind,
                    "dropping signal with no live attempt"
                );
            }
        }
    }

    fn unsubscribe(&self, keys: &[(SignalKind, String)], token: u64) {
        let mut waiters = self.waiters.lock().unwrap();
        for key in keys {
            if let Some(waiter) = waiters.get(key) {
                if waiter.token == token {
                    waiters.remove(key);
                }
            }
        }
    }
}

pub struct RouteGuard {
    router: Arc<Router>,
    keys: Vec<(SignalKind, String)>,
    token: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.router.unsubscribe(&self.keys, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_proto::{IceCandidate, SessionDescription};

    fn answer_frame(handshake_id: &str) -> SignalFrame {
        SignalFrame::Answer {
            src: Some("bob".into()),
            dst: None,
            payload: AnswerPayload {
                sdp: Some(SessionDescription::answer("v=0")),
                rejected: false,
                handshake_id: handshake_id.into(),
                metadata: None,
            },
        }
    }

    #[tokio::test]
    async fn routes_answer_to_matching_waiter() {
        let (router, _offers) = Router::new();
        let (_guard, mut rx) = router.subscribe(&[SignalKind::Answer], "h1");
        router.dispatch(answer_frame("h1"));
        match rx.recv().await {
            Some(RoutedSignal::Answer { src, payload }) => {
                assert_eq!(src, "bob");
                assert_eq!(payload.handshake_id, "h1");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_signals_are_dropped() {
        let (router, _offers) = Router::new();
        // No waiter for this handshake id: must not panic or queue.
        router.dispatch(answer_frame("stale"));
        router.dispatch(SignalFrame::Candidate {
            src: Some("bob".into()),
            dst: None,
            payload: CandidatePayload {
                candidate: IceCandidate {
                    candidate: "candidate".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
                handshake_id: "stale".into(),
            },
        });
    }

    #[tokio::test]
    async fn dropping_guard_unregisters() {
        let (router, _offers) = Router::new();
        let (guard, mut rx) = router.subscribe(&[SignalKind::Answer], "h1");
        drop(guard);
        router.dispatch(answer_frame("h1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_guard_does_not_remove_replacement() {
        let (router, _offers) = Router::new();
        let (old_guard, _old_rx) = router.subscribe(&[SignalKind::Answer], "h1");
        let (_new_guard, mut new_rx) = router.subscribe(&[SignalKind::Answer], "h1");
        drop(old_guard);
        router.dispatch(answer_frame("h1"));
        assert!(new_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn offers_go_to_the_offer_entry_point() {
        let (router, mut offers) = Router::new();
        router.dispatch(SignalFrame::Offer {
            src: Some("bob".into()),
            dst: None,
            payload: OfferPayload {
                sdp: SessionDescription::offer("v=0"),
                handshake_id: "h1".into(),
                metadata: None,
                attempt: 1,
            },
        });
        let offer = offers.recv().await.unwrap();
        assert_eq!(offer.src, "bob");
        assert_eq!(offer.payload.attempt, 1);
    }
}
