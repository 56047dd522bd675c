//! Lock-free engine counters.
//!
//! Services hold an `Arc<EngineMetrics>` and bump counters on the hot path;
//! operators read a [`MetricsSnapshot`] (serializable) for dashboards and alerts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    movements_recorded: AtomicU64,
    movements_rejected: AtomicU64,
    movements_edited: AtomicU64,
    movements_deleted: AtomicU64,
    recomputes: AtomicU64,
    consistency_violations: AtomicU64,
    concurrency_retries: AtomicU64,
    sync_succeeded: AtomicU64,
    sync_failed: AtomicU64,
    sync_timeouts: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub movements_recorded: u64,
    pub movements_rejected: u64,
    pub movements_edited: u64,
    pub movements_deleted: u64,
    pub recomputes: u64,
    pub consistency_violations: u64,
    pub concurrency_retries: u64,
    pub sync_succeeded: u64,
    pub sync_failed: u64,
    pub sync_timeouts: u64,
}

macro_rules! counter {
    ($($field:ident => $incr:ident),* $(,)?) => {
        impl EngineMetrics {
            $(
                pub fn $incr(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counter! {
    movements_recorded => record_movement,
    movements_rejected => reject_movement,
    movements_edited => edit_movement,
    movements_deleted => delete_movement,
    recomputes => recompute,
    consistency_violations => consistency_violation,
    concurrency_retries => concurrency_retry,
    sync_succeeded => sync_success,
    sync_failed => sync_failure,
    sync_timeouts => sync_timeout,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
