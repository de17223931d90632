use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::transport::PeerTransport;

/// A connected peer session tracked for reuse/dedup.
#[derive(Clone)]
pub struct Session {
    pub peer_id: String,
    pub transport: Arc<dyn PeerTransport>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptRole {
    Incoming,
    Outgoing,
}

/// Ledger entry for one live negotiation attempt, keyed by handshake id.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub handshake_id: String,
    pub peer_id: String,
    pub role: AttemptRole,
    pub ice_restarts: u32,
}

/// Why `begin` refused to start an attempt.
#[derive(Debug, Clone)]
pub enum BeginVeto {
    Ongoing,
    AlreadyConnected(Session),
}

enum PeerSlot {
    InProgress,
    Connected(Session),
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<String, PeerSlot>,
    attempts: HashMap<String, AttemptRecord>,
}

/// Dedup/reuse ledger. Per-peer transitions are strictly monotonic:
/// none → in-progress → {none, connected} → none, with `begin` acting as
/// an atomic check-and-set. When disabled every attempt proceeds and no
/// sessions are tracked.
pub struct AttemptRegistry {
    enabled: bool,
    state: Mutex<RegistryState>,
}

impl AttemptRegistry {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Claim the outgoing-attempt slot for a peer.
    pub fn begin(&self, peer_id: &str) -> Result<(), BeginVeto> {
        if !self.enabled {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        match state.peers.get(peer_id) {
            Some(PeerSlot::InProgress) => Err(BeginVeto::Ongoing),
            Some(PeerSlot::Connected(session)) => {
                Err(BeginVeto::AlreadyConnected(session.clone()))
            }
            None => {
                state
                    .peers
                    .insert(peer_id.to_string(), PeerSlot::InProgress);
                tracing::debug!(target = "signaling", peer_id = %peer_id, "attempt started");
                Ok(())
            }
        }
    }

    /// Record an established session. Reached from in-progress on the
    /// broker path; the answer side lands here directly.
    pub fn commit(&self, session: Session) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap();
        tracing::debug!(target = "signaling", peer_id = %session.peer_id, "session added");
        state
            .peers
            .insert(session.peer_id.clone(), PeerSlot::Connected(session));
    }

    /// Return a peer slot to none, from either live state.
    pub fn release(&self, peer_id: &str) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.peers.remove(peer_id).is_some() {
            tracing::debug!(target = "signaling", peer_id = %peer_id, "peer slot released");
        }
    }

    pub fn session(&self, peer_id: &str) -> Option<Session> {
        if !self.enabled {
            return None;
        }
        let state = self.state.lock().unwrap();
        match state.peers.get(peer_id) {
            Some(PeerSlot::Connected(session)) => Some(session.clone()),
            _ => None,
        }
    }

    /// Attempt-ledger bookkeeping. Tracked regardless of the reuse
    /// toggle: a handshake id identifies at most one live attempt.
    pub fn insert_attempt(&self, record: AttemptRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .attempts
            .insert(record.handshake_id.clone(), record);
    }

    pub fn bump_restarts(&self, handshake_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.attempts.get_mut(handshake_id) {
            record.ice_restarts += 1;
        }
    }

    pub fn remove_attempt(&self, handshake_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.attempts.remove(handshake_id);
    }

    pub fn attempt(&self, handshake_id: &str) -> Option<AttemptRecord> {
        let state = self.state.lock().unwrap();
        state.attempts.get(handshake_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{ConnectPolicy, MockTransport};

    fn session(peer_id: &str) -> Session {
        Session {
            peer_id: peer_id.to_string(),
            transport: MockTransport::new(ConnectPolicy::Never),
        }
    }

    #[test]
    fn second_begin_is_vetoed_while_in_progress() {
        let registry = AttemptRegistry::new(true);
        registry.begin("bob").unwrap();
        assert!(matches!(registry.begin("bob"), Err(BeginVeto::Ongoing)));
    }

    #[test]
    fn begin_after_commit_returns_existing_session() {
        let registry = AttemptRegistry::new(true);
        registry.begin("bob").unwrap();
        registry.commit(session("bob"));
        match registry.begin("bob") {
            Err(BeginVeto::AlreadyConnected(existing)) => assert_eq!(existing.peer_id, "bob"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn release_returns_slot_to_none_from_either_state() {
        let registry = AttemptRegistry::new(true);
        registry.begin("bob").unwrap();
        registry.release("bob");
        registry.begin("bob").unwrap();
        registry.commit(session("bob"));
        registry.release("bob");
        assert!(registry.begin("bob").is_ok());
    }

    #[test]
    fn disabled_registry_is_permissive() {
        let registry = AttemptRegistry::new(false);
        registry.begin("bob").unwrap();
        registry.begin("bob").unwrap();
        registry.commit(session("bob"));
        assert!(registry.session("bob").is_none());
    }

    #[test]
    fn attempt_ledger_tracks_restarts() {
        let registry = AttemptRegistry::new(true);
        registry.insert_attempt(AttemptRecord {
            handshake_id: "h1".into(),
            peer_id: "bob".into(),
            role: AttemptRole::Outgoing,
            ice_restarts: 0,
        });
        registry.bump_restarts("h1");
        registry.bump_restarts("h1");
        assert_eq!(registry.attempt("h1").unwrap().ice_restarts, 2);
        registry.remove_attempt("h1");
        assert!(registry.attempt("h1").is_none());
    }
}
