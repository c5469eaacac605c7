//! Message-related models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContactId, MessageId};

/// Text shown in place of a deleted message.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Longest preview shown in the contact list, in bytes.
const PREVIEW_MAX: usize = 80;

/// Kind of message payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// Delivery progress of a message.
///
/// Variants are declared in delivery order so that `Ord` follows the only
/// legal direction of travel: a message never moves to a lower state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sending => "sending",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
        }
    }
}

/// Rejected attempt to move a message backwards in delivery order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message {id}: delivery state cannot regress from {from:?} to {to:?}")]
pub struct StatusRejected {
    pub id: MessageId,
    pub from: DeliveryState,
    pub to: DeliveryState,
}

/// Client-local identifier of an optimistically inserted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message as returned by the REST message endpoints and carried in events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_record_state")]
    pub delivery_state: DeliveryState,
    #[serde(default)]
    pub deleted: bool,
    /// Echo of the client id the sender attached, when the sender was us.
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

fn default_record_state() -> DeliveryState {
    DeliveryState::Sent
}

/// Message acknowledged by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedMessage {
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: Option<String>,
    pub media_ref: Option<String>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub deleted: bool,
}

impl ConfirmedMessage {
    pub fn from_record(record: MessageRecord) -> Self {
        let mut msg = Self {
            id: record.id,
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            content: record.content,
            media_ref: record.media_ref,
            kind: record.kind,
            created_at: record.created_at,
            // A message the server returns has at least been sent.
            delivery: record.delivery_state.max(DeliveryState::Sent),
            deleted: false,
        };
        if record.deleted {
            msg.tombstone();
        }
        msg
    }

    /// The other party of the conversation, from `me`'s point of view.
    pub fn counterpart(&self, me: &str) -> &str {
        if self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    pub fn is_inbound(&self, me: &str) -> bool {
        self.sender_id != me
    }

    /// Replace the payload with the deletion placeholder. Identity and
    /// position in the conversation are kept.
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.content = Some(DELETED_PLACEHOLDER.to_string());
        self.media_ref = None;
    }

    pub fn preview(&self) -> String {
        preview_text(self.kind, self.content.as_deref())
    }
}

/// Optimistic message awaiting a server acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub client_id: ClientId,
    pub receiver_id: ContactId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    /// Set when the send request failed; the UI may offer a retry.
    pub failed: bool,
}

/// Entry of a conversation: either still pending or confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Pending(PendingMessage),
    Confirmed(ConfirmedMessage),
}

impl Message {
    /// Sort key: creation time, then identifier as a tie-break.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        match self {
            Message::Pending(p) => (p.created_at, p.client_id.as_str()),
            Message::Confirmed(c) => (c.created_at, c.id.as_str()),
        }
    }

    pub fn delivery_state(&self) -> DeliveryState {
        match self {
            Message::Pending(_) => DeliveryState::Sending,
            Message::Confirmed(c) => c.delivery,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Pending(_) => None,
            Message::Confirmed(c) => Some(&c.id),
        }
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Message::Pending(p) => Some(&p.client_id),
            Message::Confirmed(_) => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.order_key().0
    }

    pub fn preview(&self) -> String {
        match self {
            Message::Pending(p) => preview_text(p.kind, Some(&p.content)),
            Message::Confirmed(c) => c.preview(),
        }
    }
}

/// Contact-list preview for a message payload, cut at a char boundary.
pub fn preview_text(kind: MessageKind, content: Option<&str>) -> String {
    match kind {
        MessageKind::Image => return "[image]".to_string(),
        MessageKind::File => return "[file]".to_string(),
        MessageKind::Text | MessageKind::System => {}
    }
    let text = content.unwrap_or("").trim();
    if text.len() > PREVIEW_MAX {
        let end = text
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= PREVIEW_MAX - 3)
            .last()
            .unwrap_or(0);
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}
