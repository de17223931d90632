//! Scriptable in-memory transport for tests. Mirrors the observable
//! surface of a real peer-to-peer session object without any networking.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{
    IceCandidate, PeerTransport, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::error::TransportError;
use berth_proto::SdpKind;

/// When a mock transport reports `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// As soon as both descriptions have been applied.
    OnExchange,
    /// Only once both descriptions are applied and at least this many
    /// renegotiations have happened.
    AfterRestarts(u32),
    Never,
}

pub struct MockTransport {
    policy: ConnectPolicy,
    auto_candidate: bool,
    state: Mutex<TransportState>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<AppliedCandidate>>,
    restarts: AtomicU32,
    events_tx: broadcast::Sender<TransportEvent>,
}

/// A candidate the engine applied, with whether the remote description
/// was already in place at that moment.
#[derive(Debug, Clone)]
pub struct AppliedCandidate {
    pub candidate: IceCandidate,
    pub after_remote_description: bool,
}

impl MockTransport {
    pub fn new(policy: ConnectPolicy) -> Arc<Self> {
        Self::with_auto_candidate(policy, true)
    }

    /// `auto_candidate` makes every local description emit one gathered
    /// candidate, so candidate frames flow without test choreography.
    pub fn with_auto_candidate(policy: ConnectPolicy, auto_candidate: bool) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            policy,
            auto_candidate,
            state: Mutex::new(TransportState::New),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            restarts: AtomicU32::new(0),
            events_tx,
        })
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn applied_candidates(&self) -> Vec<AppliedCandidate> {
        self.applied.lock().unwrap().clone()
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .events_tx
            .send(TransportEvent::LocalCandidate(candidate));
    }

    /// Drive the state machine from a test (e.g. a dropped session).
    pub fn force_state(&self, state: TransportState) {
        *self.state.lock().unwrap() = state;
        let _ = self.events_tx.send(TransportEvent::StateChanged(state));
    }

    fn set_state(&self, state: TransportState) {
        let mut guard = self.state.lock().unwrap();
        if *guard == state {
            return;
        }
        *guard = state;
        drop(guard);
        let _ = self.events_tx.send(TransportEvent::StateChanged(state));
    }

    fn maybe_connect(&self) {
        let exchanged =
            self.local.lock().unwrap().is_some() && self.remote.lock().unwrap().is_some();
        let ready = match self.policy {
            ConnectPolicy::OnExchange => exchanged,
            ConnectPolicy::AfterRestarts(n) => exchanged && self.restarts() >= n,
            ConnectPolicy::Never => false,
        };
        if ready && self.connection_state() != TransportState::Connected {
            self.set_state(TransportState::Connected);
            let _ = self.events_tx.send(TransportEvent::DataChannelOpened {
                label: "data".to_string(),
            });
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn set_local_description(&self) -> Result<SessionDescription, TransportError> {
        let answering = matches!(
            self.remote.lock().unwrap().as_ref(),
            Some(desc) if desc.kind == SdpKind::Offer
        );
        let desc = if answering {
            SessionDescription::answer("v=0 mock answer")
        } else {
            SessionDescription::offer("v=0 mock offer")
        };
        *self.local.lock().unwrap() = Some(desc.clone());
        if self.connection_state() == TransportState::New {
            self.set_state(TransportState::Connecting);
        }
        if self.auto_candidate {
            self.emit_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 127.0.0.1 54400 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
        self.maybe_connect();
        Ok(desc)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        *self.remote.lock().unwrap() = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let after_remote_description = self.remote.lock().unwrap().is_some();
        self.applied.lock().unwrap().push(AppliedCandidate {
            candidate,
            after_remote_description,
        });
        Ok(())
    }

    async fn restart_negotiation(&self) -> Result<(), TransportError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        // A restart invalidates the previous answer; the next round
        // re-delivers one.
        *self.remote.lock().unwrap() = None;
        let _ = self.events_tx.send(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    fn connection_state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn close(&self) {
        self.set_state(TransportState::Closed);
    }
}

pub struct MockTransportFactory {
    policy: ConnectPolicy,
    auto_candidate: bool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new(policy: ConnectPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            auto_candidate: true,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = MockTransport::with_auto_candidate(self.policy, self.auto_candidate);
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
