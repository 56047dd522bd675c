use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, EventId, ProductId};

/// Identifier assigned by the external accounting system to a created voucher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoucherId(String);

impl VoucherId {
    pub fn new(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(DomainError::validation("voucher id cannot be empty"));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for VoucherId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What gets mirrored into the accounting system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherPayload {
    pub quantity: i64,
    pub unit: String,
    /// Free-text narration shown on the voucher.
    pub narration: Option<String>,
    /// When the underlying production event was recorded (UTC).
    pub recorded_at: DateTime<Utc>,
}

/// Sync lifecycle.
///
/// `Pending → InFlight → Synced` or `Pending → InFlight → Failed → Pending`.
/// `Synced` is absorbing. `InFlight` is the claim that keeps a second caller from
/// submitting the same event while the first call is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
}

impl core::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InFlight => "in_flight",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        })
    }
}

/// Record of one connector call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A sync-eligible event and its mirroring state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncableEvent {
    pub id: EventId,
    pub product_id: ProductId,
    pub payload: VoucherPayload,
    status: SyncStatus,
    sync_error: Option<String>,
    external_voucher_id: Option<VoucherId>,
    attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    history: Vec<SyncAttempt>,
}

impl SyncableEvent {
    /// Create a pending event.
    pub fn new(id: EventId, product_id: ProductId, payload: VoucherPayload) -> DomainResult<Self> {
        if payload.quantity <= 0 {
            return Err(DomainError::validation("voucher quantity must be positive"));
        }
        if payload.unit.trim().is_empty() {
            return Err(DomainError::validation("voucher unit cannot be empty"));
        }

        let now = Utc::now();
        Ok(Self {
            id,
            product_id,
            payload,
            status: SyncStatus::Pending,
            sync_error: None,
            external_voucher_id: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        })
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn sync_error(&self) -> Option<&str> {
        self.sync_error.as_deref()
    }

    pub fn external_voucher_id(&self) -> Option<&VoucherId> {
        self.external_voucher_id.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn history(&self) -> &[SyncAttempt] {
        &self.history
    }

    /// Claim a pending event for one connector call.
    pub fn claim(&mut self) -> DomainResult<()> {
        self.expect_status(SyncStatus::Pending, "claim")?;
        self.status = SyncStatus::InFlight;
        self.attempts += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Connector confirmed the voucher.
    pub fn mark_synced(&mut self, voucher_id: VoucherId, started_at: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(SyncStatus::InFlight, "mark synced")?;
        let now = Utc::now();
        self.status = SyncStatus::Synced;
        self.sync_error = None;
        self.external_voucher_id = Some(voucher_id);
        self.updated_at = now;
        self.push_attempt(started_at, now, None);
        Ok(())
    }

    /// Connector rejected, was unreachable or timed out.
    pub fn mark_failed(&mut self, error: impl Into<String>, started_at: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(SyncStatus::InFlight, "mark failed")?;
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "connector reported failure without a message".to_string();
        }

        let now = Utc::now();
        self.status = SyncStatus::Failed;
        self.sync_error = Some(error.clone());
        self.updated_at = now;
        self.push_attempt(started_at, now, Some(error));
        Ok(())
    }

    /// Explicit user retry: `Failed → Pending`.
    pub fn retry(&mut self) -> DomainResult<()> {
        self.expect_status(SyncStatus::Failed, "retry")?;
        self.status = SyncStatus::Pending;
        self.sync_error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn expect_status(&self, expected: SyncStatus, action: &str) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} event {} in status {} (expected {expected})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn push_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(SyncAttempt {
            attempt: self.attempts,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}
