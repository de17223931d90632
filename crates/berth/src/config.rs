use serde_json::Value;
use std::env;
use std::time::Duration;

/// Public rendezvous endpoint used when none is configured. Any
/// PeerServer-compatible relay works; to host your own, point
/// `endpoint` (or `BERTH_ENDPOINT`) at it.
pub const DEFAULT_ENDPOINT: &str = "wss://0.peerjs.com/peerjs";

/// Configuration for the signaling client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the rendezvous server.
    pub endpoint: String,
    /// Identity announced to the rendezvous server; random when `None`.
    pub peer_id: Option<String>,
    /// Static API key sent as a connect-time query parameter.
    pub api_key: String,
    /// Renegotiation budget of an outgoing attempt after the first round.
    pub max_ice_restarts: u32,
    /// Dedup/reuse ledger toggle. Off means every broker/offer proceeds.
    pub reuse_connections: bool,
    /// Control-channel connect retry budget.
    pub max_connection_attempts: u32,
    /// Deadline of one outgoing offer round.
    pub per_attempt_timeout: Duration,
    /// Deadline for an accepted incoming offer to reach connected.
    pub incoming_timeout: Duration,
    /// How long an incoming observer gets to answer before default-reject.
    pub accept_timeout: Duration,
    /// Per-try WebSocket connect deadline.
    pub connect_timeout: Duration,
    /// Deadline for the server's OPEN frame after the socket opens.
    pub open_timeout: Duration,
    /// Base of the linearly increasing wait between connect retries.
    pub backoff_step: Duration,
    pub heartbeat_interval: Duration,
    /// Metadata attached to auto-accepted or defaulted incoming answers.
    /// Relayed through the signalling server, so never put secrets here
    /// unless you trust it.
    pub default_metadata_for_incoming: Option<Value>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            peer_id: None,
            api_key: "peerjs".to_string(),
            max_ice_restarts: 10,
            reuse_connections: true,
            max_connection_attempts: 3,
            per_attempt_timeout: Duration::from_millis(1000),
            incoming_timeout: Duration::from_millis(2000),
            accept_timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(3000),
            open_timeout: Duration::from_millis(2000),
            backoff_step: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(5000),
            default_metadata_for_incoming: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults (`BERTH_ENDPOINT` overrides the rendezvous endpoint).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = env::var("BERTH_ENDPOINT") {
            if !endpoint.is_empty() {
                config.endpoint = endpoint;
            }
        }
        config
    }

    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.config.peer_id = Some(peer_id.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = api_key.into();
        self
    }

    pub fn max_ice_restarts(mut self, restarts: u32) -> Self {
        self.config.max_ice_restarts = restarts;
        self
    }

    pub fn reuse_connections(mut self, reuse: bool) -> Self {
        self.config.reuse_connections = reuse;
        self
    }

    pub fn max_connection_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connection_attempts = attempts;
        self
    }

    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_attempt_timeout = timeout;
        self
    }

    pub fn incoming_timeout(mut self, timeout: Duration) -> Self {
        self.config.incoming_timeout = timeout;
        self
    }

    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn backoff_step(mut self, step: Duration) -> Self {
        self.config.backoff_step = step;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn default_metadata_for_incoming(mut self, metadata: Value) -> Self {
        self.config.default_metadata_for_incoming = Some(metadata);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
