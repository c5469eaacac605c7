//! Reconciliation: the only path by which external input mutates the store
//!
//! Every channel event, snapshot, send acknowledgement and user action is
//! routed through [`Reconciler`], which validates it against what the store
//! already holds and reports the side effects the engine has to carry out.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::snapshot::Snapshot;
use crate::models::{
    ClientEvent, ClientId, ConfirmedMessage, ContactId, ContactRecord, MessageDeleted, MessageId,
    MessageKind, MessageRecord, MessageStatusChanged, Presence, ServerEvent, DELETED_PLACEHOLDER,
};
use crate::notify::Notification;
use crate::store::{Outcome, StatusOutcome, Store, Upsert};

/// Side effects produced by one reconciliation step.
#[derive(Debug, Default)]
pub struct Effects {
    /// Frames to emit on the event channel.
    pub outbound: Vec<ClientEvent>,
    /// Conversations whose read state must be persisted over REST.
    pub read_receipts: Vec<ContactId>,
    pub notifications: Vec<Notification>,
    /// A placeholder contact was created; a snapshot should hydrate it.
    pub needs_hydration: bool,
    /// The store changed and views should be republished.
    pub changed: bool,
}

impl Effects {
    fn merge(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.read_receipts.extend(other.read_receipts);
        self.notifications.extend(other.notifications);
        self.needs_hydration |= other.needs_hydration;
        self.changed |= other.changed;
    }
}

/// Event about a message the store does not hold yet.
#[derive(Debug)]
struct Buffered {
    message_id: MessageId,
    event: ServerEvent,
    received_at: Instant,
}

pub struct Reconciler {
    buffer: VecDeque<Buffered>,
    buffer_limit: usize,
    buffer_ttl: Duration,
    /// Timestamp of the last applied status event per message.
    status_stamps: HashMap<MessageId, DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(buffer_limit: usize, buffer_ttl: Duration) -> Self {
        Self {
            buffer: VecDeque::new(),
            buffer_limit: buffer_limit.max(1),
            buffer_ttl,
            status_stamps: HashMap::new(),
        }
    }

    /// Number of events waiting for their message to appear.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Apply one event from the event channel.
    pub fn apply_event(&mut self, store: &mut Store, event: ServerEvent, now: Instant) -> Effects {
        let mut effects = Effects::default();
        tracing::debug!(event = event.name(), "Applying event");

        match event {
            ServerEvent::PresenceChanged(e) => {
                let prev = store.contacts.get(&e.contact_id).map(|c| c.presence);
                effects.needs_hydration = prev.is_none();
                match store.contacts.apply_presence_event(
                    &e.contact_id,
                    e.presence,
                    e.last_seen_at,
                    e.at,
                ) {
                    Outcome::Applied => {
                        effects.changed = true;
                        if prev == Some(Presence::Offline) && e.presence == Presence::Online {
                            effects.notifications.push(Notification::ContactOnline {
                                display_name: display_name(store, &e.contact_id),
                                contact_id: e.contact_id,
                            });
                        }
                    }
                    Outcome::Unchanged => {}
                    Outcome::Stale => {
                        tracing::debug!(
                            contact = %e.contact_id,
                            at = %e.at,
                            "Stale presence event discarded"
                        );
                    }
                }
                effects.changed |= effects.needs_hydration;
            }
            ServerEvent::TypingChanged(e) => {
                effects.needs_hydration = !store.contacts.contains(&e.contact_id);
                match store
                    .contacts
                    .apply_typing_event(&e.contact_id, e.is_typing, e.at, now)
                {
                    Outcome::Applied => effects.changed = true,
                    Outcome::Unchanged => {}
                    Outcome::Stale => {
                        tracing::debug!(
                            contact = %e.contact_id,
                            at = %e.at,
                            "Stale typing event discarded"
                        );
                    }
                }
                effects.changed |= effects.needs_hydration;
            }
            ServerEvent::MessageReceived(e) => {
                effects.merge(self.receive_message(store, e.message, now));
            }
            ServerEvent::MessageStatusChanged(e) => {
                effects.merge(self.apply_status(store, e, now));
            }
            ServerEvent::MessageDeleted(e) => {
                effects.merge(self.apply_delete(store, e, now));
            }
            ServerEvent::ContactRemoved(e) => {
                effects.changed = self.remove_contact(store, &e.contact_id, Utc::now());
            }
        }

        effects
    }

    fn receive_message(
        &mut self,
        store: &mut Store,
        record: MessageRecord,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let client_id = record.client_id.clone();
        let msg = ConfirmedMessage::from_record(record);
        let me = store.messages.me().to_string();
        let contact = msg.counterpart(&me).to_string();
        let inbound = msg.is_inbound(&me);
        let (id, at, preview) = (msg.id.clone(), msg.created_at, msg.preview());

        effects.needs_hydration = !store.contacts.contains(&contact);

        let upsert = match client_id.filter(|c| store.messages.has_pending(c)) {
            // Our own send echoed back before the REST acknowledgement.
            Some(client_id) => {
                store.messages.confirm_pending(&client_id, msg);
                Upsert::Merged
            }
            None => store.messages.upsert_confirmed(msg),
        };

        match upsert {
            Upsert::Inserted => {
                store
                    .contacts
                    .apply_new_message_preview(&contact, preview.clone(), at, inbound);
                effects.changed = true;
                if inbound {
                    if store.contacts.is_focused(&contact) {
                        effects.merge(self.mark_read(store, &contact));
                    } else {
                        effects.notifications.push(Notification::NewMessage {
                            sender: display_name(store, &contact),
                            contact_id: contact.clone(),
                            preview,
                        });
                    }
                }
            }
            Upsert::Merged => {
                store
                    .contacts
                    .apply_new_message_preview(&contact, preview, at, false);
                effects.changed = true;
            }
            Upsert::Unchanged => {
                tracing::debug!(message = %id, "Duplicate message event discarded");
            }
        }

        effects.merge(self.replay_for(store, &id, now));
        effects
    }

    fn apply_status(
        &mut self,
        store: &mut Store,
        e: MessageStatusChanged,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        if let Some(last) = self.status_stamps.get(&e.message_id) {
            if e.at < *last {
                tracing::debug!(
                    message = %e.message_id,
                    at = %e.at,
                    "Stale status event discarded"
                );
                return effects;
            }
        }

        match store.messages.apply_status(&e.message_id, e.state) {
            Ok(StatusOutcome::Advanced) => {
                self.status_stamps.insert(e.message_id, e.at);
                effects.changed = true;
            }
            Ok(StatusOutcome::Unchanged) => {
                self.status_stamps.insert(e.message_id, e.at);
            }
            Ok(StatusOutcome::UnknownMessage) => {
                self.push_buffer(e.message_id.clone(), ServerEvent::MessageStatusChanged(e), now);
            }
            Err(rejected) => {
                tracing::debug!("{}", rejected);
            }
        }
        effects
    }

    fn apply_delete(&mut self, store: &mut Store, e: MessageDeleted, now: Instant) -> Effects {
        let mut effects = Effects::default();
        match self.tombstone(store, &e.message_id) {
            Some(changed) => effects.changed = changed,
            None => {
                self.push_buffer(e.message_id.clone(), ServerEvent::MessageDeleted(e), now);
            }
        }
        effects
    }

    /// Tombstone a message and refresh the contact preview if it was the
    /// latest one. `None` when the message is unknown.
    fn tombstone(&mut self, store: &mut Store, message_id: &str) -> Option<bool> {
        if !store.messages.tombstone(message_id)? {
            return Some(false);
        }
        let contact = store.messages.conversation_of(message_id)?.to_string();
        let last = store
            .messages
            .last(&contact)
            .filter(|m| m.id() == Some(message_id))
            .map(|m| m.created_at());
        if let Some(at) = last {
            store.contacts.apply_new_message_preview(
                &contact,
                DELETED_PLACEHOLDER.to_string(),
                at,
                false,
            );
        }
        Some(true)
    }

    fn push_buffer(&mut self, message_id: MessageId, event: ServerEvent, now: Instant) {
        if self.buffer.len() >= self.buffer_limit {
            if let Some(dropped) = self.buffer.pop_front() {
                tracing::warn!(
                    message = %dropped.message_id,
                    "Pending event buffer full, dropping {}",
                    dropped.event.name()
                );
            }
        }
        tracing::debug!(message = %message_id, "Buffering {} for unknown message", event.name());
        self.buffer.push_back(Buffered {
            message_id,
            event,
            received_at: now,
        });
    }

    /// Re-apply buffered events that refer to `message_id`.
    fn replay_for(&mut self, store: &mut Store, message_id: &str, now: Instant) -> Effects {
        let mut effects = Effects::default();
        if !self.buffer.iter().any(|b| b.message_id == message_id) {
            return effects;
        }
        let (ready, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.buffer)
            .into_iter()
            .partition(|b| b.message_id == message_id);
        self.buffer = rest;
        for entry in ready {
            effects.merge(self.apply_event(store, entry.event, now));
        }
        effects
    }

    /// Merge a REST snapshot, then resolve the buffer against it.
    ///
    /// Buffered events whose message is still unknown after the merge are
    /// dropped.
    pub fn apply_snapshot(&mut self, store: &mut Store, snapshot: Snapshot, now: Instant) -> Effects {
        let mut effects = Effects {
            changed: true,
            ..Effects::default()
        };

        let merge = store
            .contacts
            .upsert_from_snapshot(snapshot.contacts, snapshot.as_of);
        tracing::info!(
            "Snapshot merged: {} contacts ({} new, {} kept live presence)",
            merge.updated,
            merge.created.len(),
            merge.kept_presence.len()
        );

        if let Some((contact, records)) = snapshot.conversation {
            let inserted = store.messages.merge_snapshot(records);
            tracing::debug!(contact = %contact, "Conversation page merged ({} new)", inserted);
            if store.contacts.is_focused(&contact) {
                effects.merge(self.mark_read(store, &contact));
            }
        }

        let unresolved = store.contacts.placeholders();
        if !unresolved.is_empty() {
            tracing::debug!("Contacts still unknown to the server: {:?}", unresolved);
        }

        for entry in std::mem::take(&mut self.buffer) {
            if store.messages.contains(&entry.message_id) {
                effects.merge(self.apply_event(store, entry.event, now));
            } else {
                tracing::warn!(
                    message = %entry.message_id,
                    "Dropping {} for message unknown after snapshot",
                    entry.event.name()
                );
            }
        }

        effects
    }

    /// Insert an optimistic message and return its client id.
    pub fn begin_send(
        &mut self,
        store: &mut Store,
        to: &str,
        content: String,
        kind: MessageKind,
    ) -> (ClientId, Effects) {
        let at = Utc::now();
        let preview = crate::models::preview_text(kind, Some(&content));
        let needs_hydration = !store.contacts.contains(to);
        let client_id = store.messages.insert_pending(to, content, kind, at);
        store.contacts.apply_new_message_preview(to, preview, at, false);
        let effects = Effects {
            needs_hydration,
            changed: true,
            ..Effects::default()
        };
        (client_id, effects)
    }

    /// Replace the pending entry with the server's copy.
    pub fn confirm_send(
        &mut self,
        store: &mut Store,
        client_id: &ClientId,
        record: MessageRecord,
        now: Instant,
    ) -> Effects {
        let msg = ConfirmedMessage::from_record(record);
        let id = msg.id.clone();
        let mut effects = Effects::default();
        if store.messages.confirm_pending(client_id, msg) {
            effects.changed = true;
        } else {
            tracing::debug!(client_id = %client_id, "Acknowledged send no longer pending");
        }
        effects.merge(self.replay_for(store, &id, now));
        effects
    }

    pub fn fail_send(&mut self, store: &mut Store, client_id: &ClientId) -> Effects {
        Effects {
            changed: store.messages.fail_pending(client_id),
            ..Effects::default()
        }
    }

    /// Zero the unread count and queue a read receipt upstream.
    pub fn mark_read(&mut self, store: &mut Store, contact: &str) -> Effects {
        let mut effects = Effects {
            needs_hydration: !store.contacts.contains(contact),
            ..Effects::default()
        };
        let had_unread = store.contacts.mark_conversation_read(contact, Utc::now());
        let advanced = store.messages.mark_inbound_read(contact);
        effects.changed = effects.needs_hydration;
        if had_unread || advanced > 0 {
            effects.changed = true;
            effects.outbound.push(ClientEvent::MessagesRead {
                contact_id: contact.to_string(),
                up_to: store.messages.latest_inbound(contact).map(|m| m.id.clone()),
            });
            effects.read_receipts.push(contact.to_string());
        }
        effects
    }

    /// Change the focused conversation; focusing one marks it read.
    pub fn focus(&mut self, store: &mut Store, contact: Option<&str>) -> Effects {
        let mut effects = Effects {
            changed: store.contacts.focus(contact),
            ..Effects::default()
        };
        if let Some(contact) = contact {
            effects.merge(self.mark_read(store, contact));
        }
        effects
    }

    /// Soft-delete one of our messages ahead of the server event.
    pub fn delete_local(&mut self, store: &mut Store, message_id: &str) -> Effects {
        Effects {
            changed: self.tombstone(store, message_id).unwrap_or(false),
            ..Effects::default()
        }
    }

    pub fn add_contact(&mut self, store: &mut Store, record: ContactRecord) -> Effects {
        store.contacts.add_contact(record, Utc::now());
        Effects {
            changed: true,
            ..Effects::default()
        }
    }

    /// Drop a contact and its conversation as of `at`.
    pub fn remove_contact(&mut self, store: &mut Store, contact: &str, at: DateTime<Utc>) -> bool {
        for id in store.messages.remove_conversation(contact) {
            self.status_stamps.remove(&id);
        }
        store.contacts.remove_contact(contact, at).is_some()
    }

    /// The server acknowledged a removal; only snapshots issued from now on
    /// may list the contact again.
    pub fn removal_confirmed(&mut self, store: &mut Store, contact: &str) {
        store.contacts.confirm_removed(contact, Utc::now());
    }

    /// Periodic housekeeping: expire typing flags and old buffered events.
    pub fn tick(&mut self, store: &mut Store, now: Instant) -> Effects {
        let expired = store.contacts.expire_typing(now);
        while let Some(front) = self.buffer.front() {
            if now.duration_since(front.received_at) < self.buffer_ttl {
                break;
            }
            if let Some(dropped) = self.buffer.pop_front() {
                tracing::warn!(
                    message = %dropped.message_id,
                    "Dropping {} for message still unknown after {:?}",
                    dropped.event.name(),
                    self.buffer_ttl
                );
            }
        }
        Effects {
            changed: !expired.is_empty(),
            ..Effects::default()
        }
    }
}

fn display_name(store: &Store, contact: &str) -> String {
    store
        .contacts
        .get(contact)
        .map(|c| c.display_name.clone())
        .unwrap_or_else(|| contact.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DeliveryState, Message, MessageReceived, PresenceChanged, TypingChanged,
    };
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    const ME: &str = "me";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup() -> (Store, Reconciler) {
        (
            Store::new(ME, Duration::from_secs(10)),
            Reconciler::new(50, Duration::from_secs(5)),
        )
    }

    fn contact(id: &str, presence: Presence, last_seen: Option<DateTime<Utc>>) -> ContactRecord {
        ContactRecord {
            id: id.into(),
            display_name: id.to_uppercase(),
            avatar_url: None,
            presence,
            last_seen_at: last_seen,
            presence_updated_at: None,
            last_message_preview: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    fn snapshot(contacts: Vec<ContactRecord>, as_of: DateTime<Utc>) -> Snapshot {
        Snapshot {
            contacts,
            conversation: None,
            as_of,
        }
    }

    fn presence(id: &str, p: Presence, at: i64) -> ServerEvent {
        ServerEvent::PresenceChanged(PresenceChanged {
            contact_id: id.into(),
            presence: p,
            last_seen_at: None,
            at: t(at),
        })
    }

    fn typing(id: &str, is_typing: bool, at: i64) -> ServerEvent {
        ServerEvent::TypingChanged(TypingChanged {
            contact_id: id.into(),
            is_typing,
            at: t(at),
        })
    }

    fn record(id: &str, from: &str, to: &str, at: i64) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            sender_id: from.into(),
            receiver_id: to.into(),
            content: Some(format!("text {}", id)),
            media_ref: None,
            kind: MessageKind::Text,
            created_at: t(at),
            delivery_state: DeliveryState::Sent,
            deleted: false,
            client_id: None,
        }
    }

    fn received(id: &str, from: &str, to: &str, at: i64) -> ServerEvent {
        ServerEvent::MessageReceived(MessageReceived {
            message: record(id, from, to, at),
        })
    }

    fn status(id: &str, contact: &str, state: DeliveryState, at: i64) -> ServerEvent {
        ServerEvent::MessageStatusChanged(MessageStatusChanged {
            message_id: id.into(),
            contact_id: contact.into(),
            state,
            at: t(at),
        })
    }

    #[test]
    fn test_presence_order_independent() {
        let events = vec![
            presence("a", Presence::Online, 1),
            presence("a", Presence::Offline, 4),
            presence("a", Presence::Online, 3),
            presence("a", Presence::Online, 2),
        ];
        let now = Instant::now();
        for perm in [[0, 1, 2, 3], [3, 2, 1, 0], [1, 0, 3, 2], [2, 3, 0, 1]] {
            let (mut store, mut rec) = setup();
            for i in perm {
                rec.apply_event(&mut store, events[i].clone(), now);
            }
            let a = store.contacts.get("a").unwrap();
            assert_eq!(a.presence, Presence::Offline);
            assert_eq!(a.last_seen_at, Some(t(4)));
        }
    }

    #[test]
    fn test_random_permutation_matches_stamp_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let contacts: Vec<String> = (0..50).map(|i| format!("c{}", i)).collect();

        // Unique stamps so stamp order is a total order.
        let mut events = Vec::new();
        for stamp in 0..1000i64 {
            let id = contacts.choose(&mut rng).unwrap().clone();
            let event = if rand::Rng::gen_bool(&mut rng, 0.5) {
                let p = if rand::Rng::gen_bool(&mut rng, 0.5) {
                    Presence::Online
                } else {
                    Presence::Offline
                };
                presence(&id, p, stamp)
            } else {
                typing(&id, rand::Rng::gen_bool(&mut rng, 0.5), stamp)
            };
            events.push(event);
        }

        let now = Instant::now();
        let (mut ordered, mut rec) = setup();
        for e in &events {
            rec.apply_event(&mut ordered, e.clone(), now);
        }

        let mut shuffled = events.clone();
        shuffled.shuffle(&mut rng);
        let (mut permuted, mut rec) = setup();
        for e in shuffled {
            rec.apply_event(&mut permuted, e, now);
        }

        for id in &contacts {
            assert_eq!(ordered.contacts.get(id), permuted.contacts.get(id), "contact {}", id);
        }
    }

    #[test]
    fn test_resync_with_stale_snapshot_keeps_online() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_snapshot(
            &mut store,
            snapshot(vec![contact("a", Presence::Offline, Some(t(0)))], t(0)),
            now,
        );

        let effects = rec.apply_event(&mut store, presence("a", Presence::Online, 1), now);
        assert!(matches!(
            effects.notifications.as_slice(),
            [Notification::ContactOnline { contact_id, .. }] if contact_id == "a"
        ));

        // Channel drops, resync fetch completes at T2 with stale data.
        rec.apply_snapshot(
            &mut store,
            snapshot(vec![contact("a", Presence::Offline, Some(t(0)))], t(2)),
            now,
        );
        assert_eq!(store.contacts.get("a").unwrap().presence, Presence::Online);
    }

    #[test]
    fn test_stale_snapshot_keeps_preview() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_snapshot(&mut store, snapshot(vec![contact("a", Presence::Offline, None)], t(0)), now);
        rec.apply_event(&mut store, received("m1", "a", ME, 10), now);

        let mut old = contact("a", Presence::Offline, None);
        old.last_message_preview = Some("older".into());
        old.last_message_at = Some(t(3));
        rec.apply_snapshot(&mut store, snapshot(vec![old], t(11)), now);

        let a = store.contacts.get("a").unwrap();
        assert_eq!(a.last_message_preview.as_deref(), Some("text m1"));
        assert_eq!(a.unread_count, 1);
    }

    #[test]
    fn test_unknown_contact_creates_placeholder_and_requests_hydration() {
        let (mut store, mut rec) = setup();
        let effects = rec.apply_event(&mut store, typing("ghost", true, 1), Instant::now());
        assert!(effects.needs_hydration);
        assert!(effects.changed);
        assert!(!store.contacts.get("ghost").unwrap().hydrated);

        rec.apply_snapshot(
            &mut store,
            snapshot(vec![contact("ghost", Presence::Online, None)], t(2)),
            Instant::now(),
        );
        let ghost = store.contacts.get("ghost").unwrap();
        assert!(ghost.hydrated);
        assert_eq!(ghost.display_name, "GHOST");
    }

    #[test]
    fn test_new_message_notifies_and_counts_unread() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_snapshot(&mut store, snapshot(vec![contact("a", Presence::Online, None)], t(0)), now);

        let effects = rec.apply_event(&mut store, received("m1", "a", ME, 5), now);
        assert_eq!(effects.notifications.len(), 1);
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 1);

        // Duplicate delivery is ignored.
        let effects = rec.apply_event(&mut store, received("m1", "a", ME, 5), now);
        assert!(effects.notifications.is_empty());
        assert!(!effects.changed);
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 1);
    }

    #[test]
    fn test_message_in_focused_conversation_emits_receipt() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.focus(&mut store, Some("a"));
        let effects = rec.apply_event(&mut store, received("m1", "a", ME, 5), now);

        assert!(effects.notifications.is_empty());
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 0);
        assert_eq!(
            effects.outbound,
            vec![ClientEvent::MessagesRead {
                contact_id: "a".into(),
                up_to: Some("m1".into()),
            }]
        );
        assert_eq!(effects.read_receipts, vec!["a".to_string()]);
    }

    #[test]
    fn test_mark_read_twice() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_event(&mut store, received("m1", "a", ME, 5), now);
        rec.apply_event(&mut store, received("m2", "a", ME, 6), now);

        let first = rec.mark_read(&mut store, "a");
        assert_eq!(first.outbound.len(), 1);
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 0);

        let second = rec.mark_read(&mut store, "a");
        assert!(second.outbound.is_empty());
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 0);
    }

    #[test]
    fn test_status_transitions() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        let (cid, _) = rec.begin_send(&mut store, "a", "hi".into(), MessageKind::Text);
        let mut ack = record("m1", ME, "a", 1);
        ack.client_id = Some(cid.clone());
        rec.confirm_send(&mut store, &cid, ack, now);

        rec.apply_event(&mut store, status("m1", "a", DeliveryState::Delivered, 2), now);
        rec.apply_event(&mut store, status("m1", "a", DeliveryState::Read, 3), now);
        assert_eq!(store.messages.get("m1").unwrap().delivery, DeliveryState::Read);

        // Regression with a newer stamp is rejected by the monotonic rule.
        let effects = rec.apply_event(&mut store, status("m1", "a", DeliveryState::Sent, 9), now);
        assert!(!effects.changed);
        assert_eq!(store.messages.get("m1").unwrap().delivery, DeliveryState::Read);
    }

    #[test]
    fn test_status_before_ack_is_buffered_then_applied() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        let (cid, _) = rec.begin_send(&mut store, "a", "hi".into(), MessageKind::Text);

        rec.apply_event(&mut store, status("m1", "a", DeliveryState::Delivered, 2), now);
        assert_eq!(rec.buffered(), 1);

        let mut ack = record("m1", ME, "a", 1);
        ack.client_id = Some(cid.clone());
        let effects = rec.confirm_send(&mut store, &cid, ack, now);
        assert!(effects.changed);
        assert_eq!(rec.buffered(), 0);
        assert_eq!(store.messages.get("m1").unwrap().delivery, DeliveryState::Delivered);
        assert!(matches!(store.messages.conversation("a"), [Message::Confirmed(_)]));
    }

    #[test]
    fn test_buffer_dropped_after_snapshot_if_unresolved() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_event(&mut store, status("m9", "a", DeliveryState::Read, 2), now);
        rec.apply_event(&mut store, status("m1", "a", DeliveryState::Read, 2), now);
        assert_eq!(rec.buffered(), 2);

        let snap = Snapshot {
            contacts: vec![contact("a", Presence::Online, None)],
            conversation: Some(("a".into(), vec![record("m1", ME, "a", 1)])),
            as_of: t(3),
        };
        rec.apply_snapshot(&mut store, snap, now);
        assert_eq!(rec.buffered(), 0);
        assert_eq!(store.messages.get("m1").unwrap().delivery, DeliveryState::Read);
        assert!(!store.messages.contains("m9"));
    }

    #[test]
    fn test_buffer_bound_and_ttl() {
        let mut store = Store::new(ME, Duration::from_secs(10));
        let mut rec = Reconciler::new(3, Duration::from_secs(5));
        let now = Instant::now();
        for i in 0..5 {
            rec.apply_event(
                &mut store,
                status(&format!("m{}", i), "a", DeliveryState::Read, i),
                now,
            );
        }
        assert_eq!(rec.buffered(), 3);

        rec.tick(&mut store, now + Duration::from_secs(4));
        assert_eq!(rec.buffered(), 3);
        rec.tick(&mut store, now + Duration::from_secs(5));
        assert_eq!(rec.buffered(), 0);
    }

    #[test]
    fn test_typing_expires_on_tick() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_event(&mut store, typing("a", true, 1), now);
        assert!(!rec.tick(&mut store, now + Duration::from_secs(3)).changed);
        let effects = rec.tick(&mut store, now + Duration::from_secs(10));
        assert!(effects.changed);
        assert!(!store.contacts.get("a").unwrap().is_typing(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_delete_tombstones_and_updates_preview() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_event(&mut store, received("m1", "a", ME, 1), now);
        rec.apply_event(&mut store, received("m2", "a", ME, 2), now);

        let deleted = ServerEvent::MessageDeleted(MessageDeleted {
            message_id: "m2".into(),
            contact_id: "a".into(),
            at: t(3),
        });
        assert!(rec.apply_event(&mut store, deleted.clone(), now).changed);
        assert!(!rec.apply_event(&mut store, deleted, now).changed);

        assert_eq!(store.messages.conversation("a").len(), 2);
        assert_eq!(
            store.contacts.get("a").unwrap().last_message_preview.as_deref(),
            Some(DELETED_PLACEHOLDER)
        );
    }

    #[test]
    fn test_echo_of_own_send_replaces_pending() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        let (cid, _) = rec.begin_send(&mut store, "a", "hi".into(), MessageKind::Text);
        let mut echo = record("m5", ME, "a", 1);
        echo.client_id = Some(cid.clone());
        let effects = rec.apply_event(
            &mut store,
            ServerEvent::MessageReceived(MessageReceived { message: echo.clone() }),
            now,
        );
        assert!(effects.notifications.is_empty());
        assert!(!store.messages.has_pending(&cid));

        // The late REST ack finds nothing pending and does not duplicate.
        rec.confirm_send(&mut store, &cid, echo, now);
        assert_eq!(store.messages.conversation("a").len(), 1);
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 0);
    }

    #[test]
    fn test_local_read_and_removal_survive_older_snapshot() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        let mut ada = contact("a", Presence::Offline, None);
        ada.last_message_at = Some(t(1));
        ada.unread_count = 1;
        let snap = snapshot(vec![ada, contact("b", Presence::Offline, None)], t(2));

        rec.apply_snapshot(&mut store, snap.clone(), now);
        assert_eq!(store.contacts.get("a").unwrap().unread_count, 1);

        rec.mark_read(&mut store, "a");
        rec.remove_contact(&mut store, "b", Utc::now());
        rec.apply_snapshot(&mut store, snap, now);

        assert_eq!(store.contacts.get("a").unwrap().unread_count, 0);
        assert!(!store.contacts.contains("b"));
    }

    #[test]
    fn test_remove_contact_forgets_status_stamps() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        let (cid, _) = rec.begin_send(&mut store, "a", "hi".into(), MessageKind::Text);
        let mut ack = record("m1", ME, "a", 1);
        ack.client_id = Some(cid.clone());
        rec.confirm_send(&mut store, &cid, ack, now);
        rec.apply_event(&mut store, status("m1", "a", DeliveryState::Delivered, 2), now);
        assert!(rec.status_stamps.contains_key("m1"));

        assert!(rec.remove_contact(&mut store, "a", Utc::now()));
        assert!(rec.status_stamps.is_empty());
    }

    #[test]
    fn test_send_or_focus_to_unknown_contact_requests_hydration() {
        let (mut store, mut rec) = setup();
        let (_, effects) = rec.begin_send(&mut store, "new", "hi".into(), MessageKind::Text);
        assert!(effects.needs_hydration);
        assert!(!store.contacts.get("new").unwrap().hydrated);

        let effects = rec.focus(&mut store, Some("other"));
        assert!(effects.needs_hydration);
        assert!(store.contacts.contains("other"));

        let (_, effects) = rec.begin_send(&mut store, "new", "again".into(), MessageKind::Text);
        assert!(!effects.needs_hydration);
    }

    #[test]
    fn test_contact_removed() {
        let (mut store, mut rec) = setup();
        let now = Instant::now();
        rec.apply_event(&mut store, received("m1", "a", ME, 1), now);
        let effects = rec.apply_event(
            &mut store,
            ServerEvent::ContactRemoved(crate::models::ContactRemoved {
                contact_id: "a".into(),
            }),
            now,
        );
        assert!(effects.changed);
        assert!(!store.contacts.contains("a"));
        assert!(!store.messages.contains("m1"));
    }
}
