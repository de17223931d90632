//! Signaling client for brokering peer-to-peer transport sessions
//! through a PeerServer-compatible rendezvous relay. The relay only
//! carries handshake frames (offers, answers, ICE candidates); the
//! peer-to-peer transport itself is an externally supplied capability
//! driven through [`transport::PeerTransport`].

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod registry;
pub mod router;
pub mod transport;

mod negotiation;
mod offer;

pub use berth_proto as proto;

pub use broker::{BrokerEvent, BrokerHandle};
pub use client::{ClientEvent, IncomingOffer, PeerClient};
pub use config::{ClientConfig, ClientConfigBuilder, DEFAULT_ENDPOINT};
pub use error::{ErrorCode, LinkError, NegotiationError, TransportError};
pub use link::{LinkEvent, LinkPhase, SignalingLink};
pub use registry::{AttemptRecord, AttemptRegistry, AttemptRole, Session};
pub use transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
