//! Contact endpoints

use anyhow::{Context, Result};

use super::client::ChatClient;
use crate::models::ContactRecord;

/// Fetch the contact list. The server gives no ordering guarantee and may
/// repeat entries; duplicates are left for the store to collapse.
pub async fn list_contacts_data(client: &ChatClient) -> Result<Vec<ContactRecord>> {
    client
        .get("/api/contacts")
        .await?
        .json()
        .await
        .context("Failed to parse contacts response")
}

pub async fn add_contact_data(client: &ChatClient, contact_id: &str) -> Result<ContactRecord> {
    let body = serde_json::json!({ "contactId": contact_id });
    client
        .post("/api/contacts", &body)
        .await?
        .json()
        .await
        .context("Failed to parse add-contact response")
}

pub async fn remove_contact_data(client: &ChatClient, contact_id: &str) -> Result<()> {
    client
        .delete(&format!("/api/contacts/{}", contact_id))
        .await?;
    Ok(())
}

/// One line per contact for CLI output.
pub fn format_contact(c: &ContactRecord) -> String {
    let mut line = format!("{} ({})  {}", c.display_name, c.id, c.presence.as_str());
    if let Some(seen) = c.last_seen_at {
        line.push_str(&format!(", last seen {}", seen.format("%Y-%m-%d %H:%M")));
    }
    if c.unread_count > 0 {
        line.push_str(&format!("  [{} unread]", c.unread_count));
    }
    line
}
