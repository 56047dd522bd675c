//! Sync event storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use stockledger_accounting::{SyncStatus, SyncableEvent, VoucherId};
use stockledger_core::{DomainError, EventId};

/// Result of trying to claim an event for one connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The event was pending and is now in flight; the caller owns the call.
    Claimed(SyncableEvent),
    /// Already synced; nothing to submit.
    AlreadySynced(VoucherId),
    /// Another caller owns the in-flight call.
    InFlight,
    /// Failed and waiting for an explicit retry.
    Failed(Option<String>),
}

/// Sync store abstraction.
///
/// `claim` is the only way into `InFlight` and must be atomic: of two concurrent
/// claims on the same pending event exactly one returns `Claimed`.
pub trait SyncEventStore: Send + Sync {
    fn insert(&self, event: SyncableEvent) -> Result<(), SyncStoreError>;

    fn get(&self, event_id: EventId) -> Result<Option<SyncableEvent>, SyncStoreError>;

    fn claim(&self, event_id: EventId) -> Result<ClaimOutcome, SyncStoreError>;

    /// Persist the outcome of a claimed call. The stored copy must still be in flight.
    fn settle(&self, event: &SyncableEvent) -> Result<(), SyncStoreError>;

    /// `Failed → Pending`.
    fn reset_failed(&self, event_id: EventId) -> Result<SyncableEvent, SyncStoreError>;

    /// Events in insertion order, optionally restricted to one status.
    fn list(&self, status: Option<SyncStatus>) -> Result<Vec<SyncableEvent>, SyncStoreError>;

    fn stats(&self) -> Result<SyncStats, SyncStoreError>;
}

impl<S> SyncEventStore for Arc<S>
where
    S: SyncEventStore + ?Sized,
{
    fn insert(&self, event: SyncableEvent) -> Result<(), SyncStoreError> {
        (**self).insert(event)
    }

    fn get(&self, event_id: EventId) -> Result<Option<SyncableEvent>, SyncStoreError> {
        (**self).get(event_id)
    }

    fn claim(&self, event_id: EventId) -> Result<ClaimOutcome, SyncStoreError> {
        (**self).claim(event_id)
    }

    fn settle(&self, event: &SyncableEvent) -> Result<(), SyncStoreError> {
        (**self).settle(event)
    }

    fn reset_failed(&self, event_id: EventId) -> Result<SyncableEvent, SyncStoreError> {
        (**self).reset_failed(event_id)
    }

    fn list(&self, status: Option<SyncStatus>) -> Result<Vec<SyncableEvent>, SyncStoreError> {
        (**self).list(status)
    }

    fn stats(&self) -> Result<SyncStats, SyncStoreError> {
        (**self).stats()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncStoreError {
    #[error("sync event not found: {0}")]
    NotFound(EventId),
    #[error("sync event already exists: {0}")]
    AlreadyExists(EventId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for SyncStoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition(msg) => SyncStoreError::InvalidTransition(msg),
            other => SyncStoreError::Storage(other.to_string()),
        }
    }
}

/// Event counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub pending: usize,
    pub in_flight: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<EventId, SyncableEvent>,
    order: Vec<EventId>,
}

impl Inner {
    fn event_mut(&mut self, event_id: EventId) -> Result<&mut SyncableEvent, SyncStoreError> {
        self.events
            .get_mut(&event_id)
            .ok_or(SyncStoreError::NotFound(event_id))
    }
}

/// In-memory sync store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySyncEventStore {
    inner: RwLock<Inner>,
}

fn poisoned() -> SyncStoreError {
    SyncStoreError::Storage("lock poisoned".to_string())
}

impl InMemorySyncEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl SyncEventStore for InMemorySyncEventStore {
    fn insert(&self, event: SyncableEvent) -> Result<(), SyncStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.events.contains_key(&event.id) {
            return Err(SyncStoreError::AlreadyExists(event.id));
        }
        inner.order.push(event.id);
        inner.events.insert(event.id, event);
        Ok(())
    }

    fn get(&self, event_id: EventId) -> Result<Option<SyncableEvent>, SyncStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.events.get(&event_id).cloned())
    }

    fn claim(&self, event_id: EventId) -> Result<ClaimOutcome, SyncStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let event = inner.event_mut(event_id)?;

        Ok(match event.status() {
            SyncStatus::Pending => {
                event.claim()?;
                ClaimOutcome::Claimed(event.clone())
            }
            SyncStatus::InFlight => ClaimOutcome::InFlight,
            SyncStatus::Synced => match event.external_voucher_id() {
                Some(voucher_id) => ClaimOutcome::AlreadySynced(voucher_id.clone()),
                None => {
                    return Err(SyncStoreError::Storage(format!(
                        "synced event {event_id} has no voucher id"
                    )));
                }
            },
            SyncStatus::Failed => ClaimOutcome::Failed(event.sync_error().map(str::to_string)),
        })
    }

    fn settle(&self, event: &SyncableEvent) -> Result<(), SyncStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let stored = inner.event_mut(event.id)?;
        if stored.status() != SyncStatus::InFlight {
            return Err(SyncStoreError::InvalidTransition(format!(
                "event {} is {}, not in flight",
                event.id,
                stored.status()
            )));
        }
        if event.status() == SyncStatus::InFlight {
            return Err(SyncStoreError::InvalidTransition(format!(
                "event {} has no outcome to settle",
                event.id
            )));
        }
        *stored = event.clone();
        Ok(())
    }

    fn reset_failed(&self, event_id: EventId) -> Result<SyncableEvent, SyncStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let event = inner.event_mut(event_id)?;
        event.retry()?;
        Ok(event.clone())
    }

    fn list(&self, status: Option<SyncStatus>) -> Result<Vec<SyncableEvent>, SyncStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| status.is_none_or(|s| e.status() == s))
            .cloned()
            .collect())
    }

    fn stats(&self) -> Result<SyncStats, SyncStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut stats = SyncStats::default();
        for event in inner.events.values() {
            match event.status() {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::InFlight => stats.in_flight += 1,
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
