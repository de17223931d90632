//! Wire-frame definitions for the rendezvous signaling protocol.
//! Keeping these in a dedicated crate allows regeneration of bindings
//! for other languages without pulling in the client runtime.
//!
//! The relay forwards `dst`-addressed frames verbatim, rewriting them to
//! carry `src` on delivery; it never inspects payloads beyond that.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation token scoping one negotiation attempt. Retries mint a new
/// one; ICE-restart rounds of the same attempt reuse it.
pub type HandshakeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    pub handshake_id: HandshakeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// 1-based round number; ICE restarts bump it.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rejected: bool,
    pub handshake_id: HandshakeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    pub handshake_id: HandshakeId,
}

/// One JSON frame on the control channel. Inbound frames carry `src`,
/// outbound frames carry `dst`; the relay does the rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalFrame {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    #[serde(rename = "OFFER")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: OfferPayload,
    },
    #[serde(rename = "ANSWER")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: AnswerPayload,
    },
    #[serde(rename = "CANDIDATE")]
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: CandidatePayload,
    },
}

impl SignalFrame {
    pub fn offer(dst: impl Into<String>, payload: OfferPayload) -> Self {
        SignalFrame::Offer {
            src: None,
            dst: Some(dst.into()),
            payload,
        }
    }

    pub fn answer(dst: impl Into<String>, payload: AnswerPayload) -> Self {
        SignalFrame::Answer {
            src: None,
            dst: Some(dst.into()),
            payload,
        }
    }

    pub fn candidate(dst: impl Into<String>, payload: CandidatePayload) -> Self {
        SignalFrame::Candidate {
            src: None,
            dst: Some(dst.into()),
            payload,
        }
    }

    /// Sender identity as rewritten by the relay, if present.
    pub fn src(&self) -> Option<&str> {
        match self {
            SignalFrame::Offer { src, .. }
            | SignalFrame::Answer { src, .. }
            | SignalFrame::Candidate { src, .. } => src.as_deref(),
            _ => None,
        }
    }

    pub fn handshake_id(&self) -> Option<&str> {
        match self {
            SignalFrame::Offer { payload, .. } => Some(&payload.handshake_id),
            SignalFrame::Answer { payload, .. } => Some(&payload.handshake_id),
            SignalFrame::Candidate { payload, .. } => Some(&payload.handshake_id),
            _ => None,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_frame_is_bare_type_tag() {
        let text = serde_json::to_string(&SignalFrame::Heartbeat).unwrap();
        assert_eq!(text, r#"{"type":"HEARTBEAT"}"#);
    }

    #[test]
    fn offer_frame_uses_camel_case_payload() {
        let frame = SignalFrame::offer(
            "bob",
            OfferPayload {
                sdp: SessionDescription::offer("v=0"),
                handshake_id: "h1".into(),
                metadata: None,
                attempt: 1,
            },
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "OFFER",
                "dst": "bob",
                "payload": {
                    "sdp": {"type": "offer", "sdp": "v=0"},
                    "handshakeId": "h1",
                    "attempt": 1,
                }
            })
        );
    }

    #[test]
    fn rejection_answer_omits_sdp() {
        let frame = SignalFrame::answer(
            "alice",
            AnswerPayload {
                sdp: None,
                rejected: true,
                handshake_id: "h1".into(),
                metadata: Some(json!({"alreadyConnected": true})),
            },
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "ANSWER",
                "dst": "alice",
                "payload": {
                    "rejected": true,
                    "handshakeId": "h1",
                    "metadata": {"alreadyConnected": true},
                }
            })
        );
    }

    #[test]
    fn inbound_candidate_parses_from_relay_shape() {
        let text = r#"{
            "type": "CANDIDATE",
            "src": "bob",
            "payload": {
                "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMlineIndex": 0},
                "handshakeId": "h1"
            }
        }"#;
        let frame: SignalFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.src(), Some("bob"));
        assert_eq!(frame.handshake_id(), Some("h1"));
        match frame {
            SignalFrame::Candidate { payload, .. } => {
                assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(payload.candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn accepted_answer_defaults_rejected_to_false() {
        let text = r#"{
            "type": "ANSWER",
            "src": "bob",
            "payload": {"sdp": {"type": "answer", "sdp": "v=0"}, "handshakeId": "h1"}
        }"#;
        let frame: SignalFrame = serde_json::from_str(text).unwrap();
        match frame {
            SignalFrame::Answer { payload, .. } => {
                assert!(!payload.rejected);
                assert_eq!(payload.sdp.unwrap().kind, SdpKind::Answer);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
