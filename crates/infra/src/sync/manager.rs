//! Sync Queue Manager: drives sync-eligible events through the connector.
//!
//! ```text
//! pending ──claim──▶ in_flight ──voucher──▶ synced   (absorbing)
//!                        │
//!                        └──error/timeout──▶ failed ──retry──▶ pending
//! ```
//!
//! The claim is the guard against double submission: only the caller that moved
//! an event into `in_flight` talks to the connector. Connector errors are
//! recorded on the event and reported as an outcome, never as an `Err`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stockledger_accounting::{SyncStatus, SyncableEvent, VoucherId};
use stockledger_core::{DomainError, EventId};
use stockledger_observability::EngineMetrics;

use super::store::{ClaimOutcome, SyncEventStore, SyncStats, SyncStoreError};
use crate::external::{ExternalConnector, ExternalSyncError, TimedConnector};

/// Caller-visible failures of the manager itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync event not found: {0}")]
    NotFound(EventId),

    #[error("invalid sync transition: {0}")]
    InvalidTransition(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(SyncStoreError),
}

impl From<SyncStoreError> for SyncError {
    fn from(value: SyncStoreError) -> Self {
        match value {
            SyncStoreError::NotFound(id) => SyncError::NotFound(id),
            SyncStoreError::InvalidTransition(msg) => SyncError::InvalidTransition(msg),
            other => SyncError::Store(other),
        }
    }
}

impl From<DomainError> for SyncError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition(msg) => SyncError::InvalidTransition(msg),
            other => SyncError::Validation(other.to_string()),
        }
    }
}

/// What one `sync_one` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The event is synced. `already_synced` means no connector call was made.
    Synced {
        voucher_id: VoucherId,
        already_synced: bool,
    },
    /// The connector call failed; the event is now `failed`.
    Failed { error: String },
    /// Another caller is submitting this event right now.
    InFlight,
    /// The event failed earlier and needs an explicit retry first.
    AwaitingRetry { error: Option<String> },
}

/// Aggregate counts of a `sync_all` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct SyncQueueManager<S, C> {
    store: S,
    connector: TimedConnector<C>,
    metrics: Arc<EngineMetrics>,
}

impl<S, C> SyncQueueManager<S, C>
where
    S: SyncEventStore,
    C: ExternalConnector,
{
    pub fn new(store: S, connector: Arc<C>, timeout: Duration, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            connector: TimedConnector::new(connector, timeout),
            metrics,
        }
    }

    /// Entry point of the recording flow. The event must be pending.
    pub fn enqueue(&self, event: SyncableEvent) -> Result<EventId, SyncError> {
        if event.status() != SyncStatus::Pending {
            return Err(SyncError::InvalidTransition(format!(
                "cannot enqueue event {} in status {}",
                event.id,
                event.status()
            )));
        }
        let id = event.id;
        self.store.insert(event)?;
        debug!(event_id = %id, "sync event enqueued");
        Ok(id)
    }

    pub fn get(&self, event_id: EventId) -> Result<SyncableEvent, SyncError> {
        self.store
            .get(event_id)?
            .ok_or(SyncError::NotFound(event_id))
    }

    /// Events in insertion order, optionally restricted to one status.
    pub fn list(&self, status: Option<SyncStatus>) -> Result<Vec<SyncableEvent>, SyncError> {
        Ok(self.store.list(status)?)
    }

    pub fn stats(&self) -> Result<SyncStats, SyncError> {
        Ok(self.store.stats()?)
    }

    /// Explicit user retry: `failed → pending`.
    pub fn retry(&self, event_id: EventId) -> Result<SyncableEvent, SyncError> {
        let event = self.store.reset_failed(event_id)?;
        info!(event_id = %event_id, attempts = event.attempts(), "sync event reset for retry");
        Ok(event)
    }

    /// Submit one event unless it is already synced, in flight, or failed.
    pub fn sync_one(&self, event_id: EventId) -> Result<SyncOutcome, SyncError> {
        match self.store.claim(event_id)? {
            ClaimOutcome::Claimed(event) => self.submit(event),
            ClaimOutcome::AlreadySynced(voucher_id) => {
                debug!(event_id = %event_id, voucher_id = %voucher_id, "already synced; connector not called");
                Ok(SyncOutcome::Synced {
                    voucher_id,
                    already_synced: true,
                })
            }
            ClaimOutcome::InFlight => Ok(SyncOutcome::InFlight),
            ClaimOutcome::Failed(error) => Ok(SyncOutcome::AwaitingRetry { error }),
        }
    }

    /// Retry every failed event, then attempt every pending one, in insertion order.
    ///
    /// Individual failures do not stop the pass.
    pub fn sync_all(&self) -> Result<SyncSummary, SyncError> {
        let candidates: Vec<(EventId, SyncStatus)> = self
            .store
            .list(None)?
            .into_iter()
            .filter(|e| matches!(e.status(), SyncStatus::Pending | SyncStatus::Failed))
            .map(|e| (e.id, e.status()))
            .collect();

        let mut summary = SyncSummary::default();
        for (event_id, status) in candidates {
            if status == SyncStatus::Failed {
                match self.store.reset_failed(event_id) {
                    Ok(_) => {}
                    // Someone else moved it since the listing.
                    Err(SyncStoreError::InvalidTransition(_)) => continue,
                    Err(e) => {
                        error!(event_id = %event_id, error = %e, "cannot reset failed sync event");
                        summary.attempted += 1;
                        summary.failed += 1;
                        continue;
                    }
                }
            }

            match self.sync_one(event_id) {
                Ok(SyncOutcome::Synced {
                    already_synced: false,
                    ..
                }) => {
                    summary.attempted += 1;
                    summary.succeeded += 1;
                }
                Ok(SyncOutcome::Failed { .. }) => {
                    summary.attempted += 1;
                    summary.failed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(event_id = %event_id, error = %e, "sync attempt errored");
                    summary.attempted += 1;
                    summary.failed += 1;
                }
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "sync pass finished"
        );
        Ok(summary)
    }

    /// Whether the accounting agent answers within the timeout.
    pub fn test_connection(&self) -> bool {
        self.connector.test_connection()
    }

    fn submit(&self, mut event: SyncableEvent) -> Result<SyncOutcome, SyncError> {
        let event_id = event.id;
        let started_at = Utc::now();
        debug!(event_id = %event_id, attempt = event.attempts(), "submitting voucher");

        let outcome = match self.connector.create_voucher(event.clone()) {
            Ok(voucher_id) => {
                event.mark_synced(voucher_id.clone(), started_at)?;
                SyncOutcome::Synced {
                    voucher_id,
                    already_synced: false,
                }
            }
            Err(e) => {
                if matches!(e, ExternalSyncError::Timeout(_)) {
                    self.metrics.sync_timeout();
                }
                let error = e.to_string();
                event.mark_failed(error.clone(), started_at)?;
                SyncOutcome::Failed {
                    error: event.sync_error().map(str::to_string).unwrap_or(error),
                }
            }
        };

        self.store.settle(&event)?;

        match &outcome {
            SyncOutcome::Synced { voucher_id, .. } => {
                self.metrics.sync_success();
                info!(event_id = %event_id, voucher_id = %voucher_id, "sync event synced");
            }
            SyncOutcome::Failed { error } => {
                self.metrics.sync_failure();
                warn!(event_id = %event_id, attempt = event.attempts(), error = %error, "sync event failed");
            }
            _ => {}
        }
        Ok(outcome)
    }
}
