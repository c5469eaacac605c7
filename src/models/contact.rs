//! Contact-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::ContactId;

/// Online status of a contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    #[default]
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }
}

/// Contact as returned by the REST contact endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: ContactId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, alias = "avatarURL")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// When the server last changed this contact's presence, if it tracks it.
    #[serde(default)]
    pub presence_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

/// A contact as held by the contact store.
///
/// The `*_stamp` fields record the timestamp of the write that produced the
/// current value of each field family, so late or duplicated input can be
/// recognised and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub presence: Presence,
    /// Only meaningful while `presence` is offline. Never in the future.
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// False for placeholders created from an event that raced the snapshot.
    pub hydrated: bool,
    pub(crate) presence_stamp: Option<DateTime<Utc>>,
    pub(crate) typing_stamp: Option<DateTime<Utc>>,
    pub(crate) typing_until: Option<Instant>,
    /// When the user last read this conversation.
    pub(crate) read_stamp: Option<DateTime<Utc>>,
}

impl Contact {
    /// Minimal entry for an id we have not seen in any snapshot yet.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            avatar_url: None,
            presence: Presence::Offline,
            last_seen_at: None,
            last_message_preview: None,
            last_message_at: None,
            unread_count: 0,
            hydrated: false,
            presence_stamp: None,
            typing_stamp: None,
            typing_until: None,
            read_stamp: None,
        }
    }

    /// Whether the typing indicator is live at `now`.
    ///
    /// An indicator whose expiry deadline has passed reads as false even
    /// before the store sweeps it.
    pub fn is_typing(&self, now: Instant) -> bool {
        self.typing_until.map_or(false, |until| now < until)
    }
}

/// Read-only projection of a contact for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactSummary {
    pub id: ContactId,
    pub display_name: String,
    pub presence: Presence,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub is_typing: bool,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl ContactSummary {
    pub fn from_contact(contact: &Contact, now: Instant) -> Self {
        Self {
            id: contact.id.clone(),
            display_name: contact.display_name.clone(),
            presence: contact.presence,
            last_seen_at: contact.last_seen_at,
            is_typing: contact.is_typing(now),
            last_message_preview: contact.last_message_preview.clone(),
            last_message_at: contact.last_message_at,
            unread_count: contact.unread_count,
        }
    }
}
