//! Client-side state: contacts and conversations
//!
//! The store is an explicit object owned by the sync engine. All mutation
//! happens on the engine task, so none of it needs locking.

mod contacts;
mod messages;

use std::time::Duration;

use tokio::time::Instant;

pub use contacts::{ContactStore, Outcome};
pub use messages::{MessageStore, StatusOutcome, Upsert};

use crate::models::ContactSummary;

/// Contact store and message store, constructed once per session.
#[derive(Debug)]
pub struct Store {
    pub contacts: ContactStore,
    pub messages: MessageStore,
}

impl Store {
    /// `me` is the signed-in user's id; it decides which side of a message
    /// is the counterpart.
    pub fn new(me: &str, typing_expiry: Duration) -> Self {
        Self {
            contacts: ContactStore::new(typing_expiry),
            messages: MessageStore::new(me),
        }
    }

    pub fn summaries(&self, now: Instant) -> Vec<ContactSummary> {
        self.contacts.summaries(now)
    }
}
