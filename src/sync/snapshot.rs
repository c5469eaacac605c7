//! Snapshot loading: authoritative REST state on cold start, refresh and resync

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ContactId, ContactRecord, MessageRecord};

/// Authoritative state fetched over REST.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub contacts: Vec<ContactRecord>,
    /// Latest page of the focused conversation, if one was requested.
    pub conversation: Option<(ContactId, Vec<MessageRecord>)>,
    /// When the fetch was issued. Records without their own timestamps are
    /// judged as of this instant.
    pub as_of: DateTime<Utc>,
}

/// Source of snapshots (the REST API in production).
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self, focus: Option<ContactId>) -> Result<Snapshot>;
}

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    ColdStart,
    Manual,
    Resync,
    Hydration,
}

/// Whether the store reflects the latest successful fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Freshness {
    #[default]
    Loading,
    Fresh,
    Refreshing,
    /// The last fetch failed; the store holds the last good state.
    Stale,
}

impl Freshness {
    pub fn label(&self) -> &'static str {
        match self {
            Freshness::Loading => "loading",
            Freshness::Fresh => "up to date",
            Freshness::Refreshing => "refreshing",
            Freshness::Stale => "stale",
        }
    }
}

/// Handle for one in-flight fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTicket {
    generation: u64,
    pub reason: RefreshReason,
}

/// What to do with a completed fetch.
#[derive(Debug)]
pub enum Completion {
    Apply(Snapshot),
    /// A newer fetch was issued after this one; its result is discarded.
    Superseded,
    Failed(anyhow::Error),
}

/// Tracks overlapping fetches so only the latest one is applied.
///
/// Fetches are never cancelled: every request gets a generation number,
/// and a result is only applied if no newer request was issued since.
#[derive(Debug, Default)]
pub struct SnapshotLoader {
    issued: u64,
    in_flight: usize,
    hydration_pending: bool,
    freshness: Freshness,
}

impl SnapshotLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Issue a ticket for a new fetch. Hydration requests are coalesced:
    /// while one is outstanding, further ones return `None`.
    pub fn begin(&mut self, reason: RefreshReason) -> Option<SnapshotTicket> {
        if reason == RefreshReason::Hydration {
            if self.hydration_pending {
                return None;
            }
            self.hydration_pending = true;
        }
        self.issued += 1;
        self.in_flight += 1;
        if self.freshness != Freshness::Loading {
            self.freshness = Freshness::Refreshing;
        }
        tracing::debug!(generation = self.issued, "Snapshot fetch started ({:?})", reason);
        Some(SnapshotTicket {
            generation: self.issued,
            reason,
        })
    }

    /// Resolve a finished fetch.
    pub fn complete(&mut self, ticket: SnapshotTicket, result: Result<Snapshot>) -> Completion {
        self.in_flight = self.in_flight.saturating_sub(1);
        if ticket.reason == RefreshReason::Hydration {
            self.hydration_pending = false;
        }

        let latest = ticket.generation == self.issued;
        match result {
            Ok(_) if !latest => {
                tracing::debug!(
                    generation = ticket.generation,
                    "Snapshot superseded by generation {}",
                    self.issued
                );
                Completion::Superseded
            }
            Ok(snapshot) => {
                self.freshness = Freshness::Fresh;
                Completion::Apply(snapshot)
            }
            Err(e) => {
                tracing::warn!("Snapshot fetch failed: {:#}", e);
                // A newer fetch may still succeed; only the latest decides.
                if latest {
                    self.freshness = Freshness::Stale;
                }
                Completion::Failed(e)
            }
        }
    }
}
