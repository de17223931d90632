use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::ClientConfig;
use crate::error::LinkError;
use crate::router::Router;
use berth_proto::SignalFrame;

const NORMAL_CLOSURE: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Link lifecycle notifications, mapped onto client events.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Ready,
    Closed { code: Option<u16>, reason: String },
    Error(LinkError),
}

/// Observable control-channel state. Reconnection decisions are
/// transitions of this machine, not side effects buried in callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected { last_error: Option<LinkError> },
    Connecting,
    Open,
    /// Deliberately closed by `leave()`; never auto-reconnects.
    Closed,
}

struct LinkInner {
    config: Arc<ClientConfig>,
    router: Arc<Router>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    phase_tx: watch::Sender<LinkPhase>,
    phase_rx: watch::Receiver<LinkPhase>,
    peer_id: RwLock<String>,
    outbound: Mutex<Option<(u64, mpsc::UnboundedSender<SignalFrame>)>>,
    fatal: Mutex<Option<LinkError>>,
    left: AtomicBool,
    /// Connection generation; callbacks from superseded connections
    /// compare against it and bail out.
    epoch: AtomicU64,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Reconnecting control-channel client for the rendezvous server.
#[derive(Clone)]
pub struct SignalingLink {
    inner: Arc<LinkInner>,
}

impl SignalingLink {
    pub fn new(
        config: Arc<ClientConfig>,
        peer_id: String,
        router: Arc<Router>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(LinkPhase::Disconnected { last_error: None });
        Self {
            inner: Arc::new(LinkInner {
                config,
                router,
                events_tx,
                phase_tx,
                phase_rx,
                peer_id: RwLock::new(peer_id),
                outbound: Mutex::new(None),
                fatal: Mutex::new(None),
                left: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                conn_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn peer_id(&self) -> String {
        self.inner.peer_id.read().unwrap().clone()
    }

    pub fn phase(&self) -> LinkPhase {
        self.inner.phase_rx.borrow().clone()
    }

    /// Kick off a connection attempt unless one is already running or
    /// the link is open. Cheap to call from anywhere.
    pub fn spawn_connect(&self) {
        spawn_connect(&self.inner);
    }

    /// Wait until the link is open, starting a connection attempt when
    /// none is in flight. Concurrent callers all await the same attempt.
    pub async fn ensure_connection(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        let mut phase_rx = inner.phase_rx.clone();
        let mut spawned = false;
        loop {
            if let Some(fatal) = inner.fatal.lock().unwrap().clone() {
                return Err(fatal);
            }
            let phase = phase_rx.borrow_and_update().clone();
            match phase {
                LinkPhase::Open => return Ok(()),
                LinkPhase::Connecting => {}
                LinkPhase::Disconnected { last_error } => {
                    if spawned {
                        return Err(last_error.unwrap_or(LinkError::ServerConnection {
                            attempts: inner.config.max_connection_attempts,
                        }));
                    }
                    spawned = true;
                    spawn_connect(inner);
                }
                LinkPhase::Closed => {
                    if spawned {
                        return Err(LinkError::NotOpen);
                    }
                    spawned = true;
                    spawn_connect(inner);
                }
            }
            if phase_rx.changed().await.is_err() {
                return Err(LinkError::NotOpen);
            }
        }
    }

    /// Queue a frame on the open link. Fails fast when it is not open.
    pub fn send(&self, frame: SignalFrame) -> Result<(), LinkError> {
        let outbound = self.inner.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some((_, tx)) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(LinkError::NotOpen),
        }
    }

    /// Deliberately close the link. No automatic reconnection follows;
    /// a later `ensure_connection()` reconnects on demand.
    pub fn leave(&self) {
        self.inner.left.store(true, Ordering::SeqCst);
        shutdown_current(&self.inner, LinkPhase::Closed);
        tracing::info!(target = "signaling", "left the signalling server");
    }

    /// Reconnect under a new identity, waiting out any in-flight
    /// connection attempt first.
    pub async fn change_peer_id(&self, peer_id: String) {
        let inner = &self.inner;
        let mut phase_rx = inner.phase_rx.clone();
        while matches!(*phase_rx.borrow_and_update(), LinkPhase::Connecting) {
            if phase_rx.changed().await.is_err() {
                break;
            }
        }
        *inner.peer_id.write().unwrap() = peer_id;
        *inner.fatal.lock().unwrap() = None;
        if matches!(*inner.phase_rx.borrow(), LinkPhase::Open) {
            shutdown_current(inner, LinkPhase::Disconnected { last_error: None });
        }
        spawn_connect(inner);
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn spawn_connect(inner: &Arc<LinkInner>) {
    if inner.fatal.lock().unwrap().is_some() {
        return;
    }
    let mut claimed = false;
    inner.phase_tx.send_if_modified(|phase| match phase {
        LinkPhase::Connecting | LinkPhase::Open => false,
        _ => {
            *phase = LinkPhase::Connecting;
            claimed = true;
            true
        }
    });
    if !claimed {
        return;
    }
    inner.left.store(false, Ordering::SeqCst);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        run_connect(inner).await;
    });
}

async fn run_connect(inner: Arc<LinkInner>) {
    match connect_with_retries(&inner).await {
        Ok((sink, source)) => {
            if inner.left.load(Ordering::SeqCst) {
                // leave() raced the connect; do not resurrect the link.
                inner.phase_tx.send_replace(LinkPhase::Closed);
                return;
            }
            install_connection(&inner, sink, source);
            inner.phase_tx.send_replace(LinkPhase::Open);
            let _ = inner.events_tx.send(LinkEvent::Ready);
            tracing::info!(
                target = "signaling",
                peer_id = %inner.peer_id.read().unwrap(),
                "signalling link open"
            );
        }
        Err(err) => {
            tracing::warn!(target = "signaling", error = %err, "signalling link failed");
            inner.phase_tx.send_replace(LinkPhase::Disconnected {
                last_error: Some(err.clone()),
            });
            let _ = inner.events_tx.send(LinkEvent::Error(err));
        }
    }
}

enum TryFailure {
    /// Worth another try within the budget.
    Retry(String),
    /// Budget-independent failure (identity collision, bad endpoint).
    Fatal(LinkError),
}

async fn connect_with_retries(inner: &Arc<LinkInner>) -> Result<(WsSink, WsSource), LinkError> {
    let budget = inner.config.max_connection_attempts.max(1);
    let mut tries = 0u32;
    loop {
        if let Some(fatal) = inner.fatal.lock().unwrap().clone() {
            return Err(fatal);
        }
        if tries == budget {
            return Err(LinkError::ServerConnection { attempts: budget });
        }
        if tries > 0 {
            sleep(inner.config.backoff_step * tries).await;
        }
        tries += 1;
        match try_connect(inner).await {
            Ok(parts) => return Ok(parts),
            Err(TryFailure::Fatal(err)) => return Err(err),
            Err(TryFailure::Retry(reason)) => {
                tracing::warn!(
                    target = "signaling",
                    attempt = tries,
                    reason = %reason,
                    "signalling connect attempt failed"
                );
            }
        }
    }
}

async fn try_connect(inner: &Arc<LinkInner>) -> Result<(WsSink, WsSource), TryFailure> {
    let peer_id = inner.peer_id.read().unwrap().clone();
    let mut url = Url::parse(&inner.config.endpoint).map_err(|err| {
        TryFailure::Fatal(LinkError::InvalidEndpoint {
            endpoint: inner.config.endpoint.clone(),
            message: err.to_string(),
        })
    })?;
    url.query_pairs_mut()
        .append_pair("key", &inner.config.api_key)
        .append_pair("id", &peer_id)
        .append_pair("token", &random_token());

    let ws = match timeout(inner.config.connect_timeout, connect_async(url.as_str())).await {
        Err(_) => return Err(TryFailure::Retry("connect timed out".to_string())),
        Ok(Err(err)) => return Err(TryFailure::Retry(err.to_string())),
        Ok(Ok((ws, _response))) => ws,
    };
    tracing::debug!(target = "signaling", endpoint = %inner.config.endpoint, "websocket connected");
    wait_for_open(inner, ws, &peer_id).await
}

/// The socket is only usable once the server confirms with OPEN.
async fn wait_for_open(
    inner: &Arc<LinkInner>,
    ws: WsStream,
    peer_id: &str,
) -> Result<(WsSink, WsSource), TryFailure> {
    let (sink, mut source) = ws.split();
    let deadline = Instant::now() + inner.config.open_timeout;
    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(TryFailure::Retry("server open frame timed out".to_string()));
        };
        let message = match timeout(remaining, source.next()).await {
            Err(_) => return Err(TryFailure::Retry("server open frame timed out".to_string())),
            Ok(None) => return Err(TryFailure::Retry("closed before open".to_string())),
            Ok(Some(Err(err))) => return Err(TryFailure::Retry(err.to_string())),
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<SignalFrame>(&text) {
                Ok(SignalFrame::Open) => return Ok((sink, source)),
                Ok(SignalFrame::IdTaken) => {
                    let err = LinkError::PeerIdTaken {
                        peer_id: peer_id.to_string(),
                    };
                    *inner.fatal.lock().unwrap() = Some(err.clone());
                    return Err(TryFailure::Fatal(err));
                }
                _ => continue,
            },
            Message::Close(_) => {
                return Err(TryFailure::Retry("closed during handshake".to_string()));
            }
            _ => continue,
        }
    }
}

fn install_connection(inner: &Arc<LinkInner>, mut sink: WsSink, source: WsSource) {
    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalFrame>();
    *inner.outbound.lock().unwrap() = Some((epoch, out_tx.clone()));

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Ok(text) = serde_json::to_string(&frame) {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let heartbeat = {
        let interval_duration = inner.config.heartbeat_interval;
        let mut phase_rx = inner.phase_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(interval_duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if out_tx.send(SignalFrame::Heartbeat).is_err() {
                            break;
                        }
                    }
                    changed = phase_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Keep beating only while this connection is the
                        // open one.
                        if !matches!(*phase_rx.borrow(), LinkPhase::Open | LinkPhase::Connecting) {
                            break;
                        }
                    }
                }
            }
        })
    };

    let reader = {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            run_reader(inner, source, epoch).await;
        })
    };

    let mut tasks = inner.conn_tasks.lock().unwrap();
    for stale in tasks.drain(..) {
        stale.abort();
    }
    tasks.push(writer);
    tasks.push(heartbeat);
    tasks.push(reader);
}

async fn run_reader(inner: Arc<LinkInner>, mut source: WsSource, epoch: u64) {
    let mut close_code: Option<u16> = None;
    let mut error_reason: Option<String> = None;
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if !handle_frame(&inner, &text) {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data) {
                    if !handle_frame(&inner, &text) {
                        break;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "signalling socket error");
                error_reason = Some(err.to_string());
                break;
            }
        }
    }
    on_connection_closed(&inner, epoch, close_code, error_reason);
}

/// Returns false when the reader should stop consuming this connection.
fn handle_frame(inner: &Arc<LinkInner>, text: &str) -> bool {
    match serde_json::from_str::<SignalFrame>(text) {
        Ok(SignalFrame::Open) | Ok(SignalFrame::Heartbeat) => true,
        Ok(SignalFrame::IdTaken) => {
            let peer_id = inner.peer_id.read().unwrap().clone();
            let err = LinkError::PeerIdTaken { peer_id };
            *inner.fatal.lock().unwrap() = Some(err.clone());
            tracing::error!(target = "signaling", "peer id already taken on the signalling server");
            let _ = inner.events_tx.send(LinkEvent::Error(err));
            false
        }
        Ok(frame) => {
            inner.router.dispatch(frame);
            true
        }
        Err(err) => {
            tracing::debug!(target = "signaling", error = %err, "ignoring unparseable frame");
            true
        }
    }
}

fn on_connection_closed(
    inner: &Arc<LinkInner>,
    epoch: u64,
    close_code: Option<u16>,
    error_reason: Option<String>,
) {
    if inner.epoch.load(Ordering::SeqCst) != epoch {
        return; // superseded by a deliberate shutdown or a newer link
    }
    {
        let mut outbound = inner.outbound.lock().unwrap();
        if matches!(outbound.as_ref(), Some((e, _)) if *e == epoch) {
            *outbound = None;
        }
    }
    let deliberate = inner.left.load(Ordering::SeqCst);
    let fatal = inner.fatal.lock().unwrap().clone();
    let reason = error_reason
        .clone()
        .unwrap_or_else(|| "connection closed".to_string());
    tracing::warn!(
        target = "signaling",
        code = ?close_code,
        reason = %reason,
        "signalling link closed"
    );
    let _ = inner.events_tx.send(LinkEvent::Closed {
        code: close_code,
        reason: reason.clone(),
    });
    if error_reason.is_some() {
        let _ = inner
            .events_tx
            .send(LinkEvent::Error(LinkError::ConnectionLost { reason }));
    }

    let last_error = fatal
        .clone()
        .or(error_reason.map(|reason| LinkError::ConnectionLost { reason }));
    inner.phase_tx.send_if_modified(|phase| {
        if matches!(phase, LinkPhase::Open) {
            *phase = if deliberate {
                LinkPhase::Closed
            } else {
                LinkPhase::Disconnected { last_error }
            };
            true
        } else {
            false
        }
    });

    let abnormal = close_code != Some(NORMAL_CLOSURE);
    if !deliberate && fatal.is_none() && abnormal {
        tracing::info!(target = "signaling", "reconnecting to signalling server");
        spawn_connect(inner);
    }
}

/// Tear down the current connection on purpose (leave / identity change).
fn shutdown_current(inner: &Arc<LinkInner>, next_phase: LinkPhase) {
    // Invalidate in-flight reader callbacks for this connection.
    inner.epoch.fetch_add(1, Ordering::SeqCst);
    let had_connection = {
        let mut outbound = inner.outbound.lock().unwrap();
        outbound.take().is_some()
    };
    inner.phase_tx.send_replace(next_phase);
    let mut tasks = inner.conn_tasks.lock().unwrap();
    for task in tasks.drain(..) {
        task.abort();
    }
    drop(tasks);
    if had_connection {
        let _ = inner.events_tx.send(LinkEvent::Closed {
            code: Some(NORMAL_CLOSURE),
            reason: "closed by local request".to_string(),
        });
    }
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.conn_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
