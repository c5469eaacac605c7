//! Sync core: reconciliation, snapshot loading and the engine loop

pub mod engine;
pub mod reconcile;
pub mod snapshot;
pub mod watch;

pub use engine::RemoteApi;
pub use snapshot::{Snapshot, SnapshotSource};
