//! Message store: ordered conversations with optimistic sends

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{
    ClientId, ConfirmedMessage, ContactId, DeliveryState, Message, MessageId, MessageKind,
    MessageRecord, PendingMessage, StatusRejected,
};

/// Result of inserting or merging a confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Merged,
    Unchanged,
}

/// Result of a delivery-state update that was not a regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Advanced,
    Unchanged,
    UnknownMessage,
}

/// Per-conversation ordered message lists, keyed by counterpart id.
#[derive(Debug)]
pub struct MessageStore {
    me: String,
    conversations: HashMap<ContactId, Vec<Message>>,
    /// Confirmed message id -> conversation.
    by_id: HashMap<MessageId, ContactId>,
    /// Pending client id -> conversation.
    by_client_id: HashMap<ClientId, ContactId>,
}

impl MessageStore {
    pub fn new(me: &str) -> Self {
        Self {
            me: me.to_string(),
            conversations: HashMap::new(),
            by_id: HashMap::new(),
            by_client_id: HashMap::new(),
        }
    }

    /// Our own user id.
    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn conversation(&self, contact: &str) -> &[Message] {
        self.conversations
            .get(contact)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn has_pending(&self, client_id: &ClientId) -> bool {
        self.by_client_id.contains_key(client_id)
    }

    pub fn get(&self, id: &str) -> Option<&ConfirmedMessage> {
        let contact = self.by_id.get(id)?;
        self.conversation(contact).iter().find_map(|m| match m {
            Message::Confirmed(c) if c.id == id => Some(c),
            _ => None,
        })
    }

    /// Conversation that holds message `id`.
    pub fn conversation_of(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    /// Latest message of a conversation in display order.
    pub fn last(&self, contact: &str) -> Option<&Message> {
        self.conversation(contact).last()
    }

    /// Latest confirmed message sent to us in a conversation.
    pub fn latest_inbound(&self, contact: &str) -> Option<&ConfirmedMessage> {
        self.conversation(contact).iter().rev().find_map(|m| match m {
            Message::Confirmed(c) if c.is_inbound(&self.me) => Some(c),
            _ => None,
        })
    }

    /// Insert an optimistic message for `receiver` and return its client id.
    pub fn insert_pending(
        &mut self,
        receiver: &str,
        content: String,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> ClientId {
        let client_id = ClientId::new();
        let pending = PendingMessage {
            client_id: client_id.clone(),
            receiver_id: receiver.to_string(),
            content,
            kind,
            created_at,
            failed: false,
        };
        self.by_client_id
            .insert(client_id.clone(), receiver.to_string());
        self.insert_ordered(receiver, Message::Pending(pending));
        client_id
    }

    /// Swap a pending entry for its server-confirmed counterpart.
    ///
    /// The pending entry is removed and the confirmed message inserted at its
    /// own ordered position; no identifier is rewritten. If the confirmed id
    /// already arrived through another path, the pending entry is dropped and
    /// the existing message merged. Returns false for an unknown client id.
    pub fn confirm_pending(&mut self, client_id: &ClientId, confirmed: ConfirmedMessage) -> bool {
        let Some(contact) = self.by_client_id.remove(client_id) else {
            return false;
        };
        if let Some(list) = self.conversations.get_mut(&contact) {
            list.retain(|m| m.client_id() != Some(client_id));
        }
        self.upsert_confirmed(confirmed);
        true
    }

    /// Mark a pending entry as failed. Returns false for an unknown client id.
    pub fn fail_pending(&mut self, client_id: &ClientId) -> bool {
        let Some(contact) = self.by_client_id.get(client_id) else {
            return false;
        };
        let Some(list) = self.conversations.get_mut(contact) else {
            return false;
        };
        for m in list.iter_mut() {
            if let Message::Pending(p) = m {
                if &p.client_id == client_id {
                    p.failed = true;
                    return true;
                }
            }
        }
        false
    }

    /// Insert a confirmed message or merge it into the existing entry.
    ///
    /// Merging never moves delivery state backwards and never resurrects a
    /// tombstoned message.
    pub fn upsert_confirmed(&mut self, msg: ConfirmedMessage) -> Upsert {
        if let Some(existing) = self.get_mut(&msg.id) {
            let mut changed = false;
            if msg.delivery > existing.delivery {
                existing.delivery = msg.delivery;
                changed = true;
            }
            if msg.deleted && !existing.deleted {
                existing.tombstone();
                changed = true;
            }
            return if changed { Upsert::Merged } else { Upsert::Unchanged };
        }

        let contact = msg.counterpart(&self.me).to_string();
        self.by_id.insert(msg.id.clone(), contact.clone());
        self.insert_ordered(&contact, Message::Confirmed(msg));
        Upsert::Inserted
    }

    /// Move a message forward in delivery order.
    ///
    /// Replaying the current state is accepted as a no-op; moving backwards
    /// is rejected.
    pub fn apply_status(
        &mut self,
        id: &str,
        state: DeliveryState,
    ) -> Result<StatusOutcome, StatusRejected> {
        let Some(msg) = self.get_mut(id) else {
            return Ok(StatusOutcome::UnknownMessage);
        };
        if state < msg.delivery {
            return Err(StatusRejected {
                id: id.to_string(),
                from: msg.delivery,
                to: state,
            });
        }
        if state == msg.delivery {
            return Ok(StatusOutcome::Unchanged);
        }
        msg.delivery = state;
        Ok(StatusOutcome::Advanced)
    }

    /// Soft-delete a message. Returns `None` for an unknown id, otherwise
    /// whether the message was newly tombstoned.
    pub fn tombstone(&mut self, id: &str) -> Option<bool> {
        let msg = self.get_mut(id)?;
        if msg.deleted {
            return Some(false);
        }
        msg.tombstone();
        Some(true)
    }

    /// Mark every inbound message of a conversation as read locally.
    /// Returns the number of messages that advanced.
    pub fn mark_inbound_read(&mut self, contact: &str) -> usize {
        let me = self.me.clone();
        let Some(list) = self.conversations.get_mut(contact) else {
            return 0;
        };
        let mut advanced = 0;
        for m in list.iter_mut() {
            if let Message::Confirmed(c) = m {
                if c.is_inbound(&me) && c.delivery < DeliveryState::Read {
                    c.delivery = DeliveryState::Read;
                    advanced += 1;
                }
            }
        }
        advanced
    }

    /// Merge a REST page of a conversation. Duplicates are collapsed by id.
    /// Returns the number of messages newly inserted.
    pub fn merge_snapshot(&mut self, records: Vec<MessageRecord>) -> usize {
        let mut inserted = 0;
        for record in records {
            let client_id = record.client_id.clone();
            let msg = ConfirmedMessage::from_record(record);
            if let Some(client_id) = client_id.filter(|c| self.has_pending(c)) {
                self.confirm_pending(&client_id, msg);
                continue;
            }
            if self.upsert_confirmed(msg) == Upsert::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    /// Drop a whole conversation, pending entries included. Returns the
    /// ids of the confirmed messages that were dropped.
    pub fn remove_conversation(&mut self, contact: &str) -> Vec<MessageId> {
        let mut dropped = Vec::new();
        if let Some(list) = self.conversations.remove(contact) {
            for m in list {
                match m {
                    Message::Pending(p) => {
                        self.by_client_id.remove(&p.client_id);
                    }
                    Message::Confirmed(c) => {
                        self.by_id.remove(&c.id);
                        dropped.push(c.id);
                    }
                }
            }
        }
        dropped
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ConfirmedMessage> {
        let contact = self.by_id.get(id)?;
        self.conversations
            .get_mut(contact)?
            .iter_mut()
            .find_map(|m| match m {
                Message::Confirmed(c) if c.id == id => Some(c),
                _ => None,
            })
    }

    fn insert_ordered(&mut self, contact: &str, msg: Message) {
        let list = self.conversations.entry(contact.to_string()).or_default();
        let pos = list.partition_point(|m| m.order_key() <= msg.order_key());
        list.insert(pos, msg);
    }
}
