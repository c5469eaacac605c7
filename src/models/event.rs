//! Real-time event payloads exchanged over the event channel
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContactId, DeliveryState, MessageId, MessageRecord, Presence};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChanged {
    pub contact_id: ContactId,
    pub presence: Presence,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingChanged {
    pub contact_id: ContactId,
    pub is_typing: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub message: MessageRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusChanged {
    pub message_id: MessageId,
    pub contact_id: ContactId,
    pub state: DeliveryState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    pub contact_id: ContactId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRemoved {
    pub contact_id: ContactId,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    PresenceChanged(PresenceChanged),
    TypingChanged(TypingChanged),
    MessageReceived(MessageReceived),
    MessageStatusChanged(MessageStatusChanged),
    MessageDeleted(MessageDeleted),
    ContactRemoved(ContactRemoved),
}

impl ServerEvent {
    /// Parse one text frame.
    pub fn parse(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PresenceChanged(_) => "presence_changed",
            ServerEvent::TypingChanged(_) => "typing_changed",
            ServerEvent::MessageReceived(_) => "message_received",
            ServerEvent::MessageStatusChanged(_) => "message_status_changed",
            ServerEvent::MessageDeleted(_) => "message_deleted",
            ServerEvent::ContactRemoved(_) => "contact_removed",
        }
    }
}

/// Events the client emits upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Typing { contact_id: ContactId, is_typing: bool },
    /// Read receipt for everything up to and including `up_to`.
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        contact_id: ContactId,
        up_to: Option<MessageId>,
    },
    Ping,
}

impl ClientEvent {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_presence_changed() {
        let frame = r#"{"event":"presence_changed","data":{"contactId":"u1","presence":"online","at":"2024-05-01T10:00:00Z"}}"#;
        match ServerEvent::parse(frame).unwrap() {
            ServerEvent::PresenceChanged(p) => {
                assert_eq!(p.contact_id, "u1");
                assert_eq!(p.presence, Presence::Online);
                assert!(p.last_seen_at.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_received() {
        let frame = r#"{"event":"message_received","data":{"message":{"id":"m1","senderId":"u1","receiverId":"me","content":"yo","type":"text","createdAt":"2024-05-01T10:00:00Z"}}}"#;
        let event = ServerEvent::parse(frame).unwrap();
        assert_eq!(event.name(), "message_received");
        if let ServerEvent::MessageReceived(m) = event {
            assert_eq!(m.message.id, "m1");
            assert_eq!(m.message.delivery_state, DeliveryState::Sent);
        }
    }

    #[test]
    fn test_parse_unknown_event_fails() {
        assert!(ServerEvent::parse(r#"{"event":"call_started","data":{}}"#).is_err());
        assert!(ServerEvent::parse("not json").is_err());
    }

    #[test]
    fn test_client_event_frames() {
        let read = ClientEvent::MessagesRead {
            contact_id: "u1".into(),
            up_to: Some("m9".into()),
        };
        let v: serde_json::Value = serde_json::from_str(&read.to_frame().unwrap()).unwrap();
        assert_eq!(v["event"], "messages_read");
        assert_eq!(v["data"]["contactId"], "u1");
        assert_eq!(v["data"]["upTo"], "m9");

        let ping: serde_json::Value =
            serde_json::from_str(&ClientEvent::Ping.to_frame().unwrap()).unwrap();
        assert_eq!(ping["event"], "ping");
    }
}
