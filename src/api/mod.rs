//! REST API for the chat server
//!
//! CLI entry points print to stdout; the `*_data` functions in the
//! submodules return parsed records for the sync engine.

pub mod client;
mod contacts;
mod messages;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

pub use client::ChatClient;

use crate::models::{ClientId, ContactId, ContactRecord, MessageId, MessageKind, MessageRecord};
use crate::sync::{RemoteApi, Snapshot, SnapshotSource};

/// List contacts with presence and unread counts
pub async fn list_contacts() -> Result<()> {
    let client = ChatClient::new()?;
    let contacts = contacts::list_contacts_data(&client).await?;

    println!("\nContacts:");
    println!("{:-<60}", "");

    if contacts.is_empty() {
        println!("  (no contacts)");
        return Ok(());
    }

    for c in &contacts {
        println!("{}", contacts::format_contact(c));
        if let Some(ref preview) = c.last_message_preview {
            if !preview.trim().is_empty() {
                println!("  {}", preview.trim());
            }
        }
    }
    Ok(())
}

pub async fn add_contact(contact_id: &str) -> Result<()> {
    let client = ChatClient::new()?;
    let record = contacts::add_contact_data(&client, contact_id).await?;
    println!("Added {}", contacts::format_contact(&record));
    Ok(())
}

pub async fn remove_contact(contact_id: &str) -> Result<()> {
    let client = ChatClient::new()?;
    contacts::remove_contact_data(&client, contact_id).await?;
    println!("Removed {}.", contact_id);
    Ok(())
}

/// Print a conversation and mark it read.
pub async fn read_messages(contact_id: &str, limit: usize) -> Result<()> {
    let client = ChatClient::new()?;
    let msgs = messages::read_messages_data(&client, contact_id, limit).await?;

    if msgs.is_empty() {
        println!("(no messages)");
        return Ok(());
    }

    for msg in &msgs {
        println!("{}", messages::format_message(msg));
    }

    if let Err(e) = messages::mark_read_data(&client, contact_id).await {
        tracing::warn!("Could not mark conversation read: {:#}", e);
    }
    Ok(())
}

pub async fn send_message(to: &str, message: &str) -> Result<()> {
    let client = ChatClient::new()?;
    let client_id = ClientId::new();
    let record =
        messages::send_message_data(&client, to, message, MessageKind::Text, &client_id).await?;
    println!("Message sent ({}).", record.id);
    Ok(())
}

pub async fn delete_message(message_id: &str) -> Result<()> {
    let client = ChatClient::new()?;
    messages::delete_message_data(&client, message_id).await?;
    println!("Message deleted.");
    Ok(())
}

#[async_trait]
impl SnapshotSource for ChatClient {
    async fn fetch_snapshot(&self, focus: Option<ContactId>) -> Result<Snapshot> {
        let as_of = Utc::now();
        let contacts = contacts::list_contacts_data(self).await?;
        let conversation = match focus {
            Some(contact) => {
                let page = self.config().sync.page_size;
                let records = messages::read_messages_data(self, &contact, page).await?;
                Some((contact, records))
            }
            None => None,
        };
        Ok(Snapshot {
            contacts,
            conversation,
            as_of,
        })
    }
}

#[async_trait]
impl RemoteApi for ChatClient {
    async fn send_message(
        &self,
        to: ContactId,
        content: String,
        kind: MessageKind,
        client_id: ClientId,
    ) -> Result<MessageRecord> {
        messages::send_message_data(self, &to, &content, kind, &client_id).await
    }

    async fn mark_read(&self, contact: ContactId) -> Result<()> {
        messages::mark_read_data(self, &contact).await
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        messages::delete_message_data(self, &id).await
    }

    async fn add_contact(&self, id: ContactId) -> Result<ContactRecord> {
        contacts::add_contact_data(self, &id).await
    }

    async fn remove_contact(&self, id: ContactId) -> Result<()> {
        contacts::remove_contact_data(self, &id).await
    }
}
