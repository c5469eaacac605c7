//! Data models for contacts, messages and real-time events

mod contact;
mod event;
mod message;

pub use contact::*;
pub use event::*;
pub use message::*;

/// Identifier of a counterpart user.
pub type ContactId = String;

/// Server-assigned message identifier.
pub type MessageId = String;
