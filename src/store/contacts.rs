//! Contact store: contact list with presence, typing and unread state

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::{Contact, ContactId, ContactRecord, ContactSummary, Presence};

/// Result of applying one write to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The write changed state.
    Applied,
    /// The write was current but did not change anything.
    Unchanged,
    /// The write was older than what the store already holds.
    Stale,
}

/// Summary of a snapshot merge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotMerge {
    pub created: Vec<ContactId>,
    pub updated: usize,
    /// Contacts whose presence in the snapshot was older than a live event.
    pub kept_presence: Vec<ContactId>,
}

/// Client-side contact list.
#[derive(Debug)]
pub struct ContactStore {
    contacts: HashMap<ContactId, Contact>,
    focused: Option<ContactId>,
    typing_expiry: Duration,
    /// When each contact was removed locally. Snapshots issued before that
    /// instant must not bring the contact back.
    removed: HashMap<ContactId, DateTime<Utc>>,
}

impl ContactStore {
    pub fn new(typing_expiry: Duration) -> Self {
        Self {
            contacts: HashMap::new(),
            focused: None,
            typing_expiry,
            removed: HashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.contacts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn is_focused(&self, id: &str) -> bool {
        self.focused.as_deref() == Some(id)
    }

    /// Set the conversation the user is looking at. Returns whether the
    /// focus changed. Does not touch unread counts; see
    /// [`mark_conversation_read`](Self::mark_conversation_read).
    pub fn focus(&mut self, id: Option<&str>) -> bool {
        let next = id.map(String::from);
        if self.focused == next {
            return false;
        }
        self.focused = next;
        true
    }

    /// Return the entry for `id`, creating a placeholder if it is unknown.
    /// The flag is true when a placeholder was created.
    pub fn ensure(&mut self, id: &str) -> (&mut Contact, bool) {
        let created = !self.contacts.contains_key(id);
        if created {
            tracing::warn!(contact = id, "Event for unknown contact, creating placeholder");
        }
        let contact = self
            .contacts
            .entry(id.to_string())
            .or_insert_with(|| Contact::placeholder(id));
        (contact, created)
    }

    /// Add a contact confirmed by the add-contact endpoint.
    pub fn add_contact(&mut self, record: ContactRecord, as_of: DateTime<Utc>) -> bool {
        self.removed.remove(&record.id);
        let created = !self.contacts.contains_key(&record.id);
        self.merge_record(record, as_of);
        created
    }

    /// Remove a contact. Only explicit user actions delete entries.
    ///
    /// Snapshots issued at or before `at` skip the contact, so a fetch that
    /// was already in flight cannot resurrect it.
    pub fn remove_contact(&mut self, id: &str, at: DateTime<Utc>) -> Option<Contact> {
        if self.focused.as_deref() == Some(id) {
            self.focused = None;
        }
        let stamp = self.removed.entry(id.to_string()).or_insert(at);
        *stamp = (*stamp).max(at);
        self.contacts.remove(id)
    }

    /// The server acknowledged a removal at `at`. Snapshots issued before
    /// the acknowledgement may still list the contact.
    pub fn confirm_removed(&mut self, id: &str, at: DateTime<Utc>) {
        if let Some(stamp) = self.removed.get_mut(id) {
            *stamp = (*stamp).max(at);
        }
    }

    /// Merge a full or partial REST snapshot.
    ///
    /// The array may be unordered and contain duplicates; each record is
    /// merged through the same per-field timestamp rule, so duplicates
    /// collapse to the newest data. A record's presence only replaces the
    /// stored one when its timestamp is strictly newer than the last accepted
    /// presence write, which keeps a live event from being rolled back by a
    /// snapshot that was taken before it.
    pub fn upsert_from_snapshot(
        &mut self,
        records: Vec<ContactRecord>,
        as_of: DateTime<Utc>,
    ) -> SnapshotMerge {
        let mut merge = SnapshotMerge::default();
        for record in records {
            let id = record.id.clone();
            if self.removed.get(&id).map_or(false, |removed| as_of <= *removed) {
                tracing::debug!(contact = %id, "Snapshot predates removal, skipping");
                continue;
            }
            if !self.contacts.contains_key(&id) && !merge.created.contains(&id) {
                merge.created.push(id.clone());
            }
            if !self.merge_record(record, as_of) {
                merge.kept_presence.push(id);
            }
            merge.updated += 1;
        }
        self.removed.retain(|_, removed| *removed >= as_of);
        merge
    }

    /// Returns false when the record's presence was older than the store's.
    fn merge_record(&mut self, record: ContactRecord, as_of: DateTime<Utc>) -> bool {
        let focused = self.is_focused(&record.id);
        let now = Utc::now();
        let contact = self
            .contacts
            .entry(record.id.clone())
            .or_insert_with(|| Contact::placeholder(&record.id));

        if !record.display_name.is_empty() {
            contact.display_name = record.display_name;
        }
        contact.avatar_url = record.avatar_url;
        contact.hydrated = true;

        let presence_stamp = snapshot_presence_stamp(
            record.presence,
            record.presence_updated_at,
            record.last_seen_at,
            as_of,
        );
        let presence_applied = match contact.presence_stamp {
            Some(current) if presence_stamp <= current => {
                tracing::debug!(
                    contact = %contact.id,
                    "Snapshot presence older than live state, keeping {}",
                    contact.presence.as_str()
                );
                false
            }
            _ => {
                contact.presence = record.presence;
                contact.last_seen_at = match record.presence {
                    Presence::Offline => record
                        .last_seen_at
                        .or(contact.last_seen_at)
                        .map(|t| t.min(now)),
                    Presence::Online => None,
                };
                contact.presence_stamp = Some(presence_stamp);
                true
            }
        };

        let preview_newer = match (record.last_message_at, contact.last_message_at) {
            (Some(snap), Some(current)) => snap >= current,
            (Some(_), None) => true,
            (None, current) => current.is_none(),
        };
        let read_since = contact.read_stamp.map_or(false, |read| as_of <= read);
        if preview_newer {
            if record.last_message_at.is_some() {
                contact.last_message_preview = record.last_message_preview;
                contact.last_message_at = record.last_message_at;
            }
            if focused {
                contact.unread_count = 0;
            } else if !read_since {
                contact.unread_count = record.unread_count;
            }
        }

        presence_applied
    }

    /// Apply a presence change. Last writer wins by event timestamp; an
    /// identical replay is a no-op.
    ///
    /// At equal timestamps `Online` beats `Offline`, and between two
    /// `Offline` writes the later last-seen time wins, so the result does
    /// not depend on arrival order.
    pub fn apply_presence_event(
        &mut self,
        id: &str,
        presence: Presence,
        last_seen_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Outcome {
        let seen = match presence {
            Presence::Offline => Some(last_seen_at.unwrap_or(at).min(Utc::now())),
            Presence::Online => None,
        };
        let (contact, _) = self.ensure(id);

        if let Some(current) = contact.presence_stamp {
            let loses_tie =
                at == current && presence_rank(presence) < presence_rank(contact.presence);
            if at < current || loses_tie {
                return Outcome::Stale;
            }
            if at == current && presence == contact.presence && seen <= contact.last_seen_at {
                return Outcome::Unchanged;
            }
        }

        let prev = (contact.presence, contact.last_seen_at);
        contact.presence = presence;
        contact.presence_stamp = Some(at);
        contact.last_seen_at = seen;

        if prev == (contact.presence, contact.last_seen_at) {
            Outcome::Unchanged
        } else {
            Outcome::Applied
        }
    }

    /// Apply a typing change and (re)arm the expiry deadline.
    ///
    /// At equal timestamps "stopped typing" wins.
    pub fn apply_typing_event(
        &mut self,
        id: &str,
        is_typing: bool,
        at: DateTime<Utc>,
        now: Instant,
    ) -> Outcome {
        let expiry = self.typing_expiry;
        let (contact, _) = self.ensure(id);

        if let Some(current) = contact.typing_stamp {
            if at < current || (at == current && is_typing && contact.typing_until.is_none()) {
                return Outcome::Stale;
            }
        }

        let was_typing = contact.is_typing(now);
        contact.typing_stamp = Some(at);
        contact.typing_until = is_typing.then(|| now + expiry);

        if was_typing == is_typing && !is_typing {
            Outcome::Unchanged
        } else {
            Outcome::Applied
        }
    }

    /// Clear every typing flag whose deadline has passed. Returns the ids
    /// whose flag flipped.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<ContactId> {
        let mut expired = Vec::new();
        for contact in self.contacts.values_mut() {
            if let Some(until) = contact.typing_until {
                if now >= until {
                    contact.typing_until = None;
                    expired.push(contact.id.clone());
                }
            }
        }
        if !expired.is_empty() {
            tracing::debug!("Typing indicator expired for {:?}", expired);
        }
        expired
    }

    /// Update the last-message preview and optionally bump the unread count.
    ///
    /// The unread count is only incremented when the conversation is not
    /// focused. An older preview never replaces a newer one.
    pub fn apply_new_message_preview(
        &mut self,
        id: &str,
        preview: String,
        at: DateTime<Utc>,
        increment_unread: bool,
    ) -> Outcome {
        let focused = self.is_focused(id);
        let (contact, _) = self.ensure(id);
        let mut outcome = Outcome::Stale;

        if contact.last_message_at.map_or(true, |current| at >= current) {
            contact.last_message_preview = Some(preview);
            contact.last_message_at = Some(at);
            outcome = Outcome::Applied;
        }
        if increment_unread && !focused {
            contact.unread_count = contact.unread_count.saturating_add(1);
            outcome = Outcome::Applied;
        }
        outcome
    }

    /// Zero the unread count as of `at`. Snapshot counts issued at or
    /// before `at` are ignored afterwards. Idempotent; returns whether
    /// anything changed.
    pub fn mark_conversation_read(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        let (contact, _) = self.ensure(id);
        let had_unread = contact.unread_count > 0;
        contact.unread_count = 0;
        contact.read_stamp = contact.read_stamp.max(Some(at));
        had_unread
    }

    /// Contacts ordered by most recent activity, then display name.
    pub fn summaries(&self, now: Instant) -> Vec<ContactSummary> {
        let mut list: Vec<ContactSummary> = self
            .contacts
            .values()
            .map(|c| ContactSummary::from_contact(c, now))
            .collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Ids of contacts created from events and not yet seen in a snapshot.
    pub fn placeholders(&self) -> Vec<ContactId> {
        self.contacts
            .values()
            .filter(|c| !c.hydrated)
            .map(|c| c.id.clone())
            .collect()
    }
}

fn presence_rank(presence: Presence) -> u8 {
    match presence {
        Presence::Offline => 0,
        Presence::Online => 1,
    }
}

/// Timestamp a snapshot record's presence is judged by.
///
/// An explicit server-side change time wins; an offline record falls back to
/// its last-seen time; otherwise the snapshot's own request time is used.
fn snapshot_presence_stamp(
    presence: Presence,
    updated_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
    as_of: DateTime<Utc>,
) -> DateTime<Utc> {
    match (updated_at, presence) {
        (Some(at), _) => at,
        (None, Presence::Offline) => last_seen_at.unwrap_or(as_of),
        (None, Presence::Online) => as_of,
    }
}
