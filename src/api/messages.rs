//! Message endpoints

use anyhow::{Context, Result};

use super::client::ChatClient;
use crate::models::{preview_text, ClientId, MessageKind, MessageRecord, DELETED_PLACEHOLDER};

fn messages_path(contact_id: &str, limit: usize) -> String {
    format!("/api/messages/{}?limit={}", contact_id, limit)
}

fn send_body(to: &str, content: &str, kind: MessageKind, client_id: &ClientId) -> serde_json::Value {
    serde_json::json!({
        "receiverId": to,
        "content": content,
        "type": kind,
        "clientId": client_id,
    })
}

/// Latest page of a conversation, oldest first.
pub async fn read_messages_data(
    client: &ChatClient,
    contact_id: &str,
    limit: usize,
) -> Result<Vec<MessageRecord>> {
    let mut records: Vec<MessageRecord> = client
        .get(&messages_path(contact_id, limit))
        .await?
        .json()
        .await
        .context("Failed to parse messages response")?;
    records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    records.dedup_by(|a, b| a.id == b.id);
    Ok(records)
}

/// Send a message. The response is the server's copy, echoing `client_id`.
pub async fn send_message_data(
    client: &ChatClient,
    to: &str,
    content: &str,
    kind: MessageKind,
    client_id: &ClientId,
) -> Result<MessageRecord> {
    client
        .post("/api/messages", &send_body(to, content, kind, client_id))
        .await?
        .json()
        .await
        .context("Failed to parse send response")
}

pub async fn mark_read_data(client: &ChatClient, contact_id: &str) -> Result<()> {
    client
        .post(
            &format!("/api/messages/{}/read", contact_id),
            &serde_json::json!({}),
        )
        .await?;
    Ok(())
}

pub async fn delete_message_data(client: &ChatClient, message_id: &str) -> Result<()> {
    client
        .delete(&format!("/api/messages/{}", message_id))
        .await?;
    Ok(())
}

/// One line per message for CLI output.
pub fn format_message(m: &MessageRecord) -> String {
    let body = match (m.deleted, m.kind) {
        (true, _) => DELETED_PLACEHOLDER.to_string(),
        (false, MessageKind::Text | MessageKind::System) => m.content.clone().unwrap_or_default(),
        (false, kind) => preview_text(kind, m.content.as_deref()),
    };
    format!(
        "[{}] {}: {}  ({})",
        m.created_at.format("%Y-%m-%d %H:%M"),
        m.sender_id,
        body,
        m.delivery_state.as_str()
    )
}
