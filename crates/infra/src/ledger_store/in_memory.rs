use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use stockledger_core::{ExpectedVersion, MovementId, ProductId};
use stockledger_inventory::Movement;

use super::r#trait::{LedgerStore, LedgerStoreError, ProductStream, StoreWrite};

#[derive(Debug, Default)]
struct Stream {
    version: u64,
    rows: Vec<Movement>,
    positions: HashMap<MovementId, usize>,
}

impl Stream {
    fn check_version(&self, expected: ExpectedVersion) -> Result<(), LedgerStoreError> {
        expected
            .check(self.version)
            .map_err(|e| LedgerStoreError::Concurrency(e.to_string()))
    }

    fn live_position(&self, movement_id: MovementId) -> Result<usize, LedgerStoreError> {
        match self.positions.get(&movement_id) {
            Some(&pos) if !self.rows[pos].is_deleted() => Ok(pos),
            _ => Err(LedgerStoreError::NotFound(movement_id)),
        }
    }

    fn commit(&mut self, pos: usize) -> StoreWrite {
        self.version += 1;
        StoreWrite {
            movement: self.rows[pos].clone(),
            stream_version: self.version,
        }
    }
}

/// In-memory ledger store.
///
/// Streams are individually locked, so writes to different products only share
/// the brief id-index update. Intended for tests/dev and as the reference
/// semantics for durable backends.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    streams: RwLock<HashMap<ProductId, Arc<Mutex<Stream>>>>,
    index: RwLock<HashMap<MovementId, ProductId>>,
    next_sequence: AtomicU64,
}

fn poisoned() -> LedgerStoreError {
    LedgerStoreError::Storage("lock poisoned".to_string())
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, product_id: ProductId) -> Result<Option<Arc<Mutex<Stream>>>, LedgerStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams.get(&product_id).cloned())
    }

    fn stream_or_create(&self, product_id: ProductId) -> Result<Arc<Mutex<Stream>>, LedgerStoreError> {
        if let Some(stream) = self.stream(product_id)? {
            return Ok(stream);
        }
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        Ok(streams.entry(product_id).or_default().clone())
    }

    fn owner(&self, movement_id: MovementId) -> Result<ProductId, LedgerStoreError> {
        let index = self.index.read().map_err(|_| poisoned())?;
        index
            .get(&movement_id)
            .copied()
            .ok_or(LedgerStoreError::NotFound(movement_id))
    }

    fn owned_stream(&self, movement_id: MovementId) -> Result<Arc<Mutex<Stream>>, LedgerStoreError> {
        let product_id = self.owner(movement_id)?;
        self.stream(product_id)?
            .ok_or(LedgerStoreError::NotFound(movement_id))
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(
        &self,
        mut movement: Movement,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError> {
        if movement.is_deleted() {
            return Err(LedgerStoreError::InvalidWrite(
                "cannot append a deleted movement".to_string(),
            ));
        }

        let stream = self.stream_or_create(movement.product_id)?;
        let mut stream = stream.lock().map_err(|_| poisoned())?;
        stream.check_version(expected_version)?;

        {
            // Lock order: stream, then index.
            let mut index = self.index.write().map_err(|_| poisoned())?;
            if index.contains_key(&movement.id) {
                return Err(LedgerStoreError::Duplicate(movement.id));
            }
            index.insert(movement.id, movement.product_id);
        }

        movement.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let pos = stream.rows.len();
        stream.positions.insert(movement.id, pos);
        stream.rows.push(movement);

        Ok(stream.commit(pos))
    }

    fn replace(
        &self,
        movement: Movement,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError> {
        if self.owner(movement.id)? != movement.product_id {
            return Err(LedgerStoreError::InvalidWrite(format!(
                "movement {} cannot change product",
                movement.id
            )));
        }
        if movement.is_deleted() {
            return Err(LedgerStoreError::InvalidWrite(
                "use mark_deleted to delete a movement".to_string(),
            ));
        }

        let stream = self.owned_stream(movement.id)?;
        let mut stream = stream.lock().map_err(|_| poisoned())?;
        stream.check_version(expected_version)?;
        let pos = stream.live_position(movement.id)?;

        let existing = &stream.rows[pos];
        let replacement = Movement {
            sequence: existing.sequence,
            inserted_at: existing.inserted_at,
            ..movement
        };
        stream.rows[pos] = replacement;

        Ok(stream.commit(pos))
    }

    fn mark_deleted(
        &self,
        movement_id: MovementId,
        deleted_at: DateTime<Utc>,
        expected_version: ExpectedVersion,
    ) -> Result<StoreWrite, LedgerStoreError> {
        let stream = self.owned_stream(movement_id)?;
        let mut stream = stream.lock().map_err(|_| poisoned())?;
        stream.check_version(expected_version)?;
        let pos = stream.live_position(movement_id)?;

        stream.rows[pos].deleted_at = Some(deleted_at);

        Ok(stream.commit(pos))
    }

    fn get(&self, movement_id: MovementId) -> Result<Option<Movement>, LedgerStoreError> {
        let stream = match self.owned_stream(movement_id) {
            Ok(stream) => stream,
            Err(LedgerStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let stream = stream.lock().map_err(|_| poisoned())?;
        Ok(stream
            .positions
            .get(&movement_id)
            .map(|&pos| stream.rows[pos].clone()))
    }

    fn load_product(&self, product_id: ProductId) -> Result<ProductStream, LedgerStoreError> {
        let Some(stream) = self.stream(product_id)? else {
            return Ok(ProductStream::default());
        };
        let stream = stream.lock().map_err(|_| poisoned())?;
        Ok(ProductStream {
            version: stream.version,
            movements: stream.rows.clone(),
        })
    }
}
