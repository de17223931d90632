mod support;

use std::time::Duration;

use berth::transport::mock::{ConnectPolicy, MockTransportFactory};
use berth::{ClientConfig, ClientEvent, ErrorCode, LinkError, PeerClient};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn link_config(url: &str, peer_id: &str) -> ClientConfig {
    ClientConfig::builder()
        .endpoint(url)
        .peer_id(peer_id)
        .api_key("test")
        .max_connection_attempts(3)
        .connect_timeout(Duration::from_millis(1000))
        .open_timeout(Duration::from_millis(1000))
        .backoff_step(Duration::from_millis(50))
        .heartbeat_interval(Duration::from_millis(100))
        .build()
}

fn client(url: &str, peer_id: &str) -> PeerClient {
    PeerClient::new(
        link_config(url, peer_id),
        MockTransportFactory::new(ConnectPolicy::OnExchange),
    )
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event stream ended")
}

#[tokio::test]
async fn heartbeats_flow_at_fixed_interval_without_traffic() {
    support::init_tracing();
    let server = support::start().await;
    let alice = client(&server.url(), "alice");
    alice.wait_ready().await.unwrap();

    sleep(Duration::from_millis(450)).await;
    assert!(
        server.heartbeat_count("alice") >= 3,
        "expected at least 3 heartbeats, saw {}",
        server.heartbeat_count("alice")
    );
}

#[tokio::test]
async fn abnormal_close_reconnects_automatically() {
    support::init_tracing();
    let server = support::start().await;
    let alice = client(&server.url(), "alice");
    let mut events = alice.events().unwrap();
    alice.wait_ready().await.unwrap();
    assert!(matches!(next_event(&mut events).await, ClientEvent::Ready));
    assert_eq!(server.connect_count("alice"), 1);

    assert!(server.kick("alice", 1011));
    server
        .wait_until(Duration::from_secs(3), |s| s.connect_count("alice") == 2)
        .await;
    alice.wait_ready().await.unwrap();

    let mut saw_abnormal_close = false;
    loop {
        match next_event(&mut events).await {
            ClientEvent::Closed { code, .. } => {
                assert_eq!(code, Some(1011));
                saw_abnormal_close = true;
            }
            ClientEvent::Ready => break,
            other => panic!("unexpected event during reconnect: {other:?}"),
        }
    }
    assert!(saw_abnormal_close);
}

#[tokio::test]
async fn leave_closes_without_reconnecting() {
    support::init_tracing();
    let server = support::start().await;
    let alice = client(&server.url(), "alice");
    alice.wait_ready().await.unwrap();
    assert_eq!(server.connect_count("alice"), 1);

    alice.leave();
    server
        .wait_until(Duration::from_secs(3), |s| !s.is_registered("alice"))
        .await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        server.connect_count("alice"),
        1,
        "leave must not auto-reconnect"
    );
}

#[tokio::test]
async fn reconnects_on_demand_after_leave() {
    support::init_tracing();
    let server = support::start().await;
    let alice = client(&server.url(), "alice");
    alice.wait_ready().await.unwrap();
    alice.leave();
    server
        .wait_until(Duration::from_secs(3), |s| !s.is_registered("alice"))
        .await;

    alice.wait_ready().await.unwrap();
    assert_eq!(server.connect_count("alice"), 2);
}

#[tokio::test]
async fn taken_peer_id_is_fatal_and_never_retried() {
    support::init_tracing();
    let server = support::start().await;
    let first = client(&server.url(), "dup");
    first.wait_ready().await.unwrap();

    let second = client(&server.url(), "dup");
    let err = second.wait_ready().await.unwrap_err();
    assert_eq!(err, LinkError::PeerIdTaken { peer_id: "dup".into() });
    assert_eq!(err.code(), ErrorCode::SignallingServerPeerIdTaken);

    // The collision is terminal: no background reconnect, and later
    // readiness checks fail immediately with the same error.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connect_count("dup"), 1);
    assert_eq!(
        second.wait_ready().await.unwrap_err().code(),
        ErrorCode::SignallingServerPeerIdTaken
    );
}

#[tokio::test]
async fn connect_budget_exhaustion_surfaces_link_error() {
    support::init_tracing();
    let config = ClientConfig::builder()
        .endpoint("ws://127.0.0.1:9/signal")
        .peer_id("alice")
        .max_connection_attempts(2)
        .connect_timeout(Duration::from_millis(500))
        .backoff_step(Duration::from_millis(10))
        .build();
    let alice = PeerClient::new(config, MockTransportFactory::new(ConnectPolicy::OnExchange));
    let err = alice.wait_ready().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SignallingServerConnection);
    assert!(matches!(err, LinkError::ServerConnection { attempts: 2 }));
}

#[tokio::test]
async fn change_peer_id_reregisters_under_new_identity() {
    support::init_tracing();
    let server = support::start().await;
    let alice = client(&server.url(), "alice");
    alice.wait_ready().await.unwrap();

    alice.change_peer_id(Some("alice-2".to_string())).await;
    alice.wait_ready().await.unwrap();
    assert_eq!(alice.peer_id(), "alice-2");
    server
        .wait_until(Duration::from_secs(3), |s| s.is_registered("alice-2"))
        .await;
}
