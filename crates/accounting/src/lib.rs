//! Accounting-sync domain module.
//!
//! Sync-eligible events and the state machine that governs mirroring them into
//! an external accounting system. Pure domain logic only: no IO, no connector,
//! no persistence concerns.

pub mod sync_event;

pub use sync_event::{SyncAttempt, SyncStatus, SyncableEvent, VoucherId, VoucherPayload};
