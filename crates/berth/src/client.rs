use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::BrokerHandle;
use crate::config::ClientConfig;
use crate::error::{LinkError, NegotiationError};
use crate::link::{LinkEvent, SignalingLink};
use crate::offer::run_offer_dispatcher;
use crate::registry::{AttemptRegistry, Session};
use crate::router::Router;
use crate::transport::TransportFactory;
use berth_proto::OfferPayload;

/// Lifecycle and negotiation events observed by the client's owner.
#[derive(Debug)]
pub enum ClientEvent {
    /// The signalling link is open and registered.
    Ready,
    Closed {
        code: Option<u16>,
        reason: String,
    },
    Error(LinkError),
    /// An incoming negotiation reached a connected transport.
    Connection {
        peer_id: String,
        payload: OfferPayload,
        session: Session,
    },
    /// An accepted incoming negotiation terminated without connecting.
    FailedConnection {
        peer_id: String,
        payload: OfferPayload,
        error: NegotiationError,
    },
}

/// An offer awaiting an accept/reject decision. Unanswered offers are
/// rejected after the configured accept timeout.
pub struct IncomingOffer {
    pub peer_id: String,
    pub payload: OfferPayload,
    pub(crate) reply: oneshot::Sender<(bool, Option<Value>)>,
}

impl IncomingOffer {
    /// Decide the offer. `metadata` rides along with the answer and is
    /// relayed through the signalling server, so no secrets unless you
    /// trust it; `None` falls back to the configured default.
    pub fn accept(self, granted: bool, metadata: Option<Value>) {
        let _ = self.reply.send((granted, metadata));
    }
}

impl fmt::Debug for IncomingOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingOffer")
            .field("peer_id", &self.peer_id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Everything the negotiation machinery shares.
pub(crate) struct EngineCtx {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) link: SignalingLink,
    pub(crate) router: Arc<Router>,
    pub(crate) registry: Arc<AttemptRegistry>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) events_tx: mpsc::UnboundedSender<ClientEvent>,
    pub(crate) incoming_tx: mpsc::UnboundedSender<IncomingOffer>,
    pub(crate) incoming_observed: AtomicBool,
}

/// The signaling client: owns the reconnecting link, the dedup
/// registry, and the incoming-offer machinery, and mints outgoing
/// brokers.
pub struct PeerClient {
    ctx: Arc<EngineCtx>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingOffer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerClient {
    /// Build the client and start connecting to the rendezvous server.
    /// Readiness (or failure) arrives on the event stream and through
    /// [`PeerClient::wait_ready`].
    pub fn new(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let config = Arc::new(config);
        let peer_id = config
            .peer_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (router, offers_rx) = Router::new();
        let registry = AttemptRegistry::new(config.reuse_connections);
        let link = SignalingLink::new(
            Arc::clone(&config),
            peer_id,
            Arc::clone(&router),
            link_events_tx,
        );

        let ctx = Arc::new(EngineCtx {
            config,
            link,
            router,
            registry,
            factory,
            events_tx: events_tx.clone(),
            incoming_tx,
            incoming_observed: AtomicBool::new(false),
        });

        let pump = tokio::spawn(pump_link_events(link_events_rx, events_tx));
        let dispatcher = tokio::spawn(run_offer_dispatcher(Arc::clone(&ctx), offers_rx));
        ctx.link.spawn_connect();

        Self {
            ctx,
            events_rx: Mutex::new(Some(events_rx)),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            tasks: Mutex::new(vec![pump, dispatcher]),
        }
    }

    pub fn peer_id(&self) -> String {
        self.ctx.link.peer_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    /// Wait for an open link, reconnecting if needed. Concurrent
    /// callers share the single in-flight attempt.
    pub async fn wait_ready(&self) -> Result<(), LinkError> {
        self.ctx.link.ensure_connection().await
    }

    /// Leave the rendezvous server. Existing peer sessions are
    /// untouched; no automatic reconnection follows.
    pub fn leave(&self) {
        self.ctx.link.leave();
    }

    /// Reconnect under a new identity (random when `None`).
    pub async fn change_peer_id(&self, peer_id: Option<String>) {
        let peer_id = peer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.ctx.link.change_peer_id(peer_id).await;
    }

    /// Create the negotiation trigger for an outgoing connection.
    /// Consult [`BrokerHandle::events`] for the outcome; dedup vetoes
    /// are delivered there immediately.
    pub fn broker(&self, peer_id: impl Into<String>, metadata: Option<Value>) -> BrokerHandle {
        BrokerHandle::new(Arc::clone(&self.ctx), peer_id.into(), metadata)
    }

    /// Take the lifecycle event stream. Yields `None` on second call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Take the incoming-offer stream. Taking it registers an observer:
    /// offers are then prompted (with default-reject on timeout) instead
    /// of auto-accepted.
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingOffer>> {
        let receiver = self.incoming_rx.lock().unwrap().take();
        if receiver.is_some() {
            self.ctx.incoming_observed.store(true, Ordering::SeqCst);
        }
        receiver
    }

    /// The live session for a peer, when reuse tracking is enabled.
    pub fn session(&self, peer_id: &str) -> Option<Session> {
        self.ctx.registry.session(peer_id)
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn pump_link_events(
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    while let Some(event) = link_events.recv().await {
        let mapped = match event {
            LinkEvent::Ready => ClientEvent::Ready,
            LinkEvent::Closed { code, reason } => ClientEvent::Closed { code, reason },
            LinkEvent::Error(err) => ClientEvent::Error(err),
        };
        if events_tx.send(mapped).is_err() {
            break;
        }
    }
}
