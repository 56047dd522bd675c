use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockledger_core::{ExpectedVersion, MovementId, ProductId};
use stockledger_inventory::Movement;

/// Full contents of one product stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductStream {
    /// Number of writes ever applied to the stream.
    pub version: u64,
    /// Every row in insertion order, soft-deleted ones included.
    pub movements: Vec<Movement>,
}

impl ProductStream {
    /// Rows that still count towards stock.
    pub fn live(&self) -> impl Iterator<Item = &Movement> {
        self.movements.iter().filter(|m| !m.is_deleted())
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWrite {
    /// The row as persisted (sequence assigned on append).
    pub movement: Movement,
    /// Stream version after the write.
    pub stream_version: u64,
}

/// Ledger store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, stock admission).
#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("movement not found: {0}")]
    NotFound(MovementId),

    #[error("movement already exists: {0}")]
    Duplicate(MovementId),

    #[error("invalid write: {0}")]
    InvalidWrite(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Product-scoped ledger store.
///
/// Implementations must:
/// - assign a strictly increasing `sequence` to every appended row
/// - bump the stream version by one on every successful write
/// - reject a write whose `ExpectedVersion` does not match the stream version
/// - never return rows of another product from `load_product`
pub trait LedgerStore: Send + Sync {
    /// Append a new row to its product stream.
    fn append(
        &self,
        movement: Movement,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError>;

    /// Replace a live row (same id, same product) with an edited version.
    fn replace(
        &self,
        movement: Movement,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError>;

    /// Soft-delete a live row.
    fn mark_deleted(
        &self,
        movement_id: MovementId,
        deleted_at: DateTime<Utc>,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError>;

    fn get(&self, movement_id: MovementId) -> Result<Option<Movement>, LedgerStoreError>;

    /// Load the full stream of one product (empty stream if unknown).
    fn load_product(&self, product_id: ProductId) -> Result<ProductStream, LedgerStoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn append(
        &self,
        movement: Movement,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError> {
        (**self).append(movement, expected_version)
    }

    fn replace(
        &self,
        movement: Movement,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError> {
        (**self).replace(movement, expected_version)
    }

    fn mark_deleted(
        &self,
        movement_id: MovementId,
        deleted_at: DateTime<Utc>,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError> {
        (**self).mark_deleted(movement_id, deleted_at, expected_version)
    }

    fn get(&self, movement_id: MovementId) -> Result<Option<Movement>, LedgerStoreError> {
        (**self).get(movement_id)
    }

    fn load_product(&self, product_id: ProductId) -> Result<ProductStream, LedgerStoreError> {
        (**self).load_product(product_id)
    }
}
