//! In-process rendezvous relay and a raw scripted peer for driving the
//! client from the wire side.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

enum PeerCmd {
    Frame(String),
    Kick(u16),
}

struct PeerEntry {
    seq: u64,
    tx: mpsc::UnboundedSender<PeerCmd>,
}

#[derive(Default)]
struct RelayState {
    peers: Mutex<HashMap<String, PeerEntry>>,
    heartbeats: Mutex<HashMap<String, usize>>,
    connects: Mutex<HashMap<String, usize>>,
    seq: AtomicU64,
}

/// A PeerServer-style relay: registers peers by the `id` query
/// parameter, confirms with OPEN (or ID-TAKEN), and forwards
/// `dst`-addressed frames rewritten to carry `src`.
pub struct Rendezvous {
    addr: SocketAddr,
    state: Arc<RelayState>,
    server: JoinHandle<()>,
}

pub async fn start() -> Rendezvous {
    let state = Arc::new(RelayState::default());
    let app = Router::new()
        .route("/signal", get(ws_handler))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test relay");
    let addr = listener.local_addr().expect("relay local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Rendezvous {
        addr,
        state,
        server,
    }
}

impl Rendezvous {
    pub fn url(&self) -> String {
        format!("ws://{}/signal", self.addr)
    }

    pub fn heartbeat_count(&self, peer_id: &str) -> usize {
        self.state
            .heartbeats
            .lock()
            .unwrap()
            .get(peer_id)
            .copied()
            .unwrap_or(0)
    }

    /// Successful registrations for this identity so far.
    pub fn connect_count(&self, peer_id: &str) -> usize {
        self.state
            .connects
            .lock()
            .unwrap()
            .get(peer_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.state.peers.lock().unwrap().contains_key(peer_id)
    }

    /// Close a peer's socket from the server side with the given code.
    /// The registration is dropped immediately so a reconnecting client
    /// cannot collide with its own dying connection.
    pub fn kick(&self, peer_id: &str, code: u16) -> bool {
        let mut peers = self.state.peers.lock().unwrap();
        match peers.remove(peer_id) {
            Some(entry) => entry.tx.send(PeerCmd::Kick(code)).is_ok(),
            None => false,
        }
    }

    pub async fn wait_until(&self, deadline: Duration, mut predicate: impl FnMut(&Self) -> bool) {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if predicate(self) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("relay condition not reached within {deadline:?}");
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn ws_handler(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer_id = params.get("id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, peer_id, state))
}

async fn handle_socket(mut socket: WebSocket, peer_id: String, state: Arc<RelayState>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let seq = state.seq.fetch_add(1, Ordering::SeqCst);
    let taken = {
        let mut peers = state.peers.lock().unwrap();
        if peers.contains_key(&peer_id) {
            true
        } else {
            peers.insert(peer_id.clone(), PeerEntry { seq, tx });
            *state
                .connects
                .lock()
                .unwrap()
                .entry(peer_id.clone())
                .or_default() += 1;
            false
        }
    };
    if taken {
        let _ = socket
            .send(WsMessage::Text(r#"{"type":"ID-TAKEN"}"#.to_string()))
            .await;
        return;
    }
    let _ = socket
        .send(WsMessage::Text(r#"{"type":"OPEN"}"#.to_string()))
        .await;

    let (mut sender, mut receiver) = socket.split();
    let forward = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                PeerCmd::Frame(text) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                PeerCmd::Kick(code) => {
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: "kicked".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => relay_frame(&state, &peer_id, &text),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    let mut peers = state.peers.lock().unwrap();
    if matches!(peers.get(&peer_id), Some(entry) if entry.seq == seq) {
        peers.remove(&peer_id);
    }
}

fn relay_frame(state: &Arc<RelayState>, src: &str, text: &str) {
    let Ok(mut value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    if value.get("type").and_then(Value::as_str) == Some("HEARTBEAT") {
        *state
            .heartbeats
            .lock()
            .unwrap()
            .entry(src.to_string())
            .or_default() += 1;
        return;
    }
    let Some(dst) = value.get("dst").and_then(Value::as_str).map(String::from) else {
        return;
    };
    if let Some(frame) = value.as_object_mut() {
        frame.remove("dst");
        frame.insert("src".to_string(), Value::String(src.to_string()));
    }
    let peers = state.peers.lock().unwrap();
    if let Some(entry) = peers.get(&dst) {
        // Unknown destinations are dropped, like the real relay.
        let _ = entry.tx.send(PeerCmd::Frame(value.to_string()));
    }
}

/// A bare WebSocket peer driven directly by a test, for scripting
/// answer-side behavior on the wire.
pub struct ScriptedPeer {
    writer: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        tokio_tungstenite::tungstenite::Message,
    >,
    reader: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl ScriptedPeer {
    pub async fn connect(url: &str, peer_id: &str) -> Self {
        let endpoint = format!("{url}?key=test&id={peer_id}&token=scripted");
        let (ws, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .expect("scripted peer connect");
        let (writer, reader) = ws.split();
        let mut peer = Self { writer, reader };
        let open = peer.recv().await.expect("open frame");
        assert_eq!(open["type"], "OPEN");
        peer
    }

    pub async fn recv(&mut self) -> Option<Value> {
        while let Some(message) = self.reader.next().await {
            match message {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                    if let Ok(value) = serde_json::from_str(&text) {
                        return Some(value);
                    }
                }
                Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }

    pub async fn send(&mut self, value: Value) {
        self.writer
            .send(tokio_tungstenite::tungstenite::Message::Text(
                value.to_string(),
            ))
            .await
            .expect("scripted peer send");
    }
}
