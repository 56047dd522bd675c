//! Sync queue: storage of sync-eligible events and the manager that mirrors them
//! into the external accounting system.

mod manager;
mod store;

pub use manager::{SyncError, SyncOutcome, SyncQueueManager, SyncSummary};
pub use store::{ClaimOutcome, InMemorySyncEventStore, SyncEventStore, SyncStats, SyncStoreError};
