//! Real-time events relayed between session participants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EndReason, ParticipantId, SessionId};

/// An event carried by the room relay.
///
/// Payloads are opaque to the relay and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Chat {
        #[serde(default)]
        payload: Value,
        /// Client-chosen id; retries with the same id are delivered once.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    Typing {
        #[serde(default)]
        payload: Value,
    },
    CallOffer {
        #[serde(default)]
        payload: Value,
    },
    CallAnswer {
        #[serde(default)]
        payload: Value,
    },
    IceCandidate {
        #[serde(default)]
        payload: Value,
    },
    SessionEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<EndReason>,
    },
    ParticipantJoined {
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    DeliveryFailed {
        seq: u64,
        recipients: Vec<ParticipantId>,
    },
}

impl RelayEvent {
    /// Short label for logs.
    pub const fn type_label(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Typing { .. } => "typing",
            Self::CallOffer { .. } => "call_offer",
            Self::CallAnswer { .. } => "call_answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::SessionEnd { .. } => "session_end",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }

    /// Whether a connected client may originate this event.
    pub const fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Self::Chat { .. }
                | Self::Typing { .. }
                | Self::CallOffer { .. }
                | Self::CallAnswer { .. }
                | Self::IceCandidate { .. }
                | Self::SessionEnd { .. }
        )
    }
}

/// A relayed event addressed to one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    /// Sender, or `None` for events emitted by the engine.
    pub from: Option<ParticipantId>,
    /// Per-room sequence number.
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    pub event: RelayEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_with_opaque_payload() {
        let json = r#"{"type":"chat","payload":{"text":"hi","attachments":[]},"client_msg_id":"m-1"}"#;
        let event: RelayEvent = serde_json::from_str(json).unwrap();
        let RelayEvent::Chat {
            payload,
            client_msg_id,
        } = event
        else {
            panic!("expected chat");
        };
        assert_eq!(payload["text"], "hi");
        assert_eq!(client_msg_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn parse_ice_candidate() {
        let json = r#"{"type":"ice_candidate","payload":{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 9 typ host"}}"#;
        let event: RelayEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.type_label(), "ice_candidate");
        assert!(event.is_client_originated());
    }

    #[test]
    fn session_end_serializes_reason() {
        let event = RelayEvent::SessionEnd {
            reason: Some(EndReason::InsufficientFunds),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_end");
        assert_eq!(json["reason"], "insufficient_funds");
    }

    #[test]
    fn presence_events_are_engine_only() {
        let event = RelayEvent::ParticipantLeft {
            participant_id: "bob".into(),
        };
        assert!(!event.is_client_originated());
    }
}
