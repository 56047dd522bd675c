//! Aggregate Service: the single writer of every product's cached stock counter.
//!
//! ## Write path
//!
//! ```text
//! request
//!   ↓
//! 1. Validate (quantity > 0, patch shape)            → Validation
//!   ↓
//! 2. Lock the product slot (per-product mutex)
//!   ↓
//! 3. Admission against the authoritative counter     → InsufficientStock
//!   ↓
//! 4. Write the ledger row with ExpectedVersion       → reload + retry on conflict
//!   ↓
//! 5. Apply the delta to the counter, publish, unlock
//! ```
//!
//! Steps 3 to 5 happen under the product lock, so no other writer of the same
//! product can interleave and no negative counter is ever observable. Different
//! products use different locks.
//!
//! Readers never take the product lock: `current_stock` loads the last
//! published value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stockledger_core::{DomainError, ExpectedVersion, MovementId, ProductId};
use stockledger_inventory::{
    Movement, MovementPatch, NewMovement, NewProduct, Product, net_stock,
};
use stockledger_observability::EngineMetrics;

use crate::consistency::{ConsistencyReport, ConsistencyViolation, RecomputeOutcome};
use crate::ledger_store::{LedgerStore, LedgerStoreError, StoreWrite};

/// Caller-visible failure of the ledger write path.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The stream kept moving under us after every bounded retry.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error(transparent)]
    Store(LedgerStoreError),
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::InsufficientStock {
                requested,
                available,
            } => LedgerError::InsufficientStock {
                requested,
                available,
            },
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
            DomainError::InvalidTransition(msg) | DomainError::InvariantViolation(msg) => {
                LedgerError::Validation(msg)
            }
        }
    }
}

impl From<LedgerStoreError> for LedgerError {
    fn from(value: LedgerStoreError) -> Self {
        match value {
            LedgerStoreError::Concurrency(msg) => LedgerError::ConcurrencyConflict(msg),
            LedgerStoreError::NotFound(id) => LedgerError::NotFound(format!("movement {id}")),
            other => LedgerError::Store(other),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// State guarded by the per-product write lock.
#[derive(Debug)]
struct SlotState {
    /// Authoritative counter; only read for admission while the lock is held.
    current: i64,
    /// Stream version this counter corresponds to.
    version: u64,
}

#[derive(Debug)]
struct ProductSlot {
    definition: NewProduct,
    state: Mutex<SlotState>,
    published: AtomicI64,
    dirty: AtomicBool,
}

impl ProductSlot {
    fn lock(&self) -> LedgerResult<MutexGuard<'_, SlotState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Store(LedgerStoreError::Storage("product lock poisoned".to_string())))
    }

    fn publish(&self, state: &SlotState) {
        self.published.store(state.current, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Product {
        self.definition
            .with_stock(self.published.load(Ordering::SeqCst))
    }
}

/// Owns and mutates each product's cached current-stock counter.
#[derive(Debug)]
pub struct AggregateService<S> {
    store: S,
    slots: RwLock<HashMap<ProductId, Arc<ProductSlot>>>,
    metrics: Arc<EngineMetrics>,
    max_conflict_retries: u32,
}

impl<S: LedgerStore> AggregateService<S> {
    pub fn new(store: S, metrics: Arc<EngineMetrics>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            slots: RwLock::new(HashMap::new()),
            metrics,
            max_conflict_retries,
        }
    }

    /// Register a product. Existing ledger rows for it (if any) seed the counter.
    pub fn register_product(&self, definition: NewProduct) -> LedgerResult<Product> {
        definition.validate()?;

        let mut slots = self
            .slots
            .write()
            .map_err(|_| LedgerError::Store(LedgerStoreError::Storage("catalog lock poisoned".to_string())))?;
        if slots.contains_key(&definition.id) {
            return Err(LedgerError::Conflict(format!(
                "product {} already registered",
                definition.id
            )));
        }

        let stream = self.store.load_product(definition.id)?;
        let current = net_stock(&stream.movements)?;
        let slot = Arc::new(ProductSlot {
            definition,
            state: Mutex::new(SlotState {
                current,
                version: stream.version,
            }),
            published: AtomicI64::new(current),
            dirty: AtomicBool::new(false),
        });
        let product = slot.snapshot();
        slots.insert(product.id(), slot);

        info!(product_id = %product.id(), current_stock = current, "product registered");
        Ok(product)
    }

    /// Last published stock of a product. Never blocks on writers.
    pub fn current_stock(&self, product_id: ProductId) -> LedgerResult<i64> {
        Ok(self.slot(product_id)?.published.load(Ordering::SeqCst))
    }

    pub fn product(&self, product_id: ProductId) -> LedgerResult<Product> {
        Ok(self.slot(product_id)?.snapshot())
    }

    /// All registered products, ordered by id.
    pub fn products(&self) -> LedgerResult<Vec<Product>> {
        let mut products: Vec<Product> = self
            .all_slots()?
            .iter()
            .map(|slot| slot.snapshot())
            .collect();
        products.sort_by_key(Product::id);
        Ok(products)
    }

    pub fn product_ids(&self) -> LedgerResult<Vec<ProductId>> {
        let mut ids: Vec<ProductId> = self
            .all_slots()?
            .iter()
            .map(|slot| slot.definition.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Products at or below their alert threshold.
    pub fn low_stock_products(&self) -> LedgerResult<Vec<Product>> {
        Ok(self
            .products()?
            .into_iter()
            .filter(Product::is_low_stock)
            .collect())
    }

    /// Products whose counter awaits a recompute.
    pub fn dirty_products(&self) -> LedgerResult<Vec<ProductId>> {
        let mut ids: Vec<ProductId> = self
            .all_slots()?
            .iter()
            .filter(|slot| slot.dirty.load(Ordering::SeqCst))
            .map(|slot| slot.definition.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Live ledger rows of one product, in insertion order.
    pub fn live_movements(&self, product_id: ProductId) -> LedgerResult<Vec<Movement>> {
        self.slot(product_id)?;
        let stream = self.store.load_product(product_id)?;
        Ok(stream.live().cloned().collect())
    }

    /// A live ledger row.
    pub fn movement(&self, movement_id: MovementId) -> LedgerResult<Movement> {
        self.live_row(movement_id)
    }

    /// Record a stock-in or stock-out movement.
    pub fn record_movement(&self, request: NewMovement) -> LedgerResult<Movement> {
        let product_id = request.product_id;
        let movement = Movement::record(MovementId::new(), request, Utc::now())
            .inspect_err(|_| self.metrics.reject_movement())?;

        let slot = self.slot(product_id)?;
        let mut state = slot.lock()?;

        let delta = movement.signed_delta();
        let mut after = 0;
        let written = self.write_with_retry(&slot, &mut state, |state| {
            after = admit(state.current, delta, movement.quantity)?;
            Ok(self
                .store
                .append(movement.clone(), ExpectedVersion::Exact(state.version))?)
        });

        let written = match written {
            Ok(w) => w,
            Err(e) => {
                self.metrics.reject_movement();
                debug!(product_id = %product_id, error = %e, "movement rejected");
                return Err(e);
            }
        };

        let before = state.current;
        state.current = after;
        state.version = written.stream_version;
        slot.publish(&state);
        self.metrics.record_movement();

        info!(
            product_id = %product_id,
            movement_id = %written.movement.id,
            kind = %written.movement.kind(),
            quantity = written.movement.quantity,
            current_stock = state.current,
            "movement recorded"
        );
        warn_on_low_stock(&slot, before, state.current);

        Ok(written.movement)
    }

    /// Retroactively edit a movement and recompute the product's aggregate.
    pub fn edit_movement(&self, movement_id: MovementId, patch: MovementPatch) -> LedgerResult<Movement> {
        let original = self.live_row(movement_id)?;
        patch.apply_to(&original)?;

        let slot = self.slot(original.product_id)?;
        let mut state = slot.lock()?;

        let mut delta = 0;
        let mut after = 0;
        let written = self.write_with_retry(&slot, &mut state, |state| {
            // Re-read under the lock: the row may have changed since the pre-check.
            let current_row = self.live_row(movement_id)?;
            let edited = patch.apply_to(&current_row)?;
            delta = edited.signed_delta() - current_row.signed_delta();
            after = admit(state.current, delta, -delta)?;
            let written = self
                .store
                .replace(edited, ExpectedVersion::Exact(state.version))?;
            slot.dirty.store(true, Ordering::SeqCst);
            Ok(written)
        })?;

        self.apply_retroactive(&slot, &mut state, after, written.stream_version);
        self.metrics.edit_movement();
        info!(
            product_id = %original.product_id,
            movement_id = %movement_id,
            delta,
            "movement edited"
        );
        self.recompute_locked(&slot, &mut state)?;

        Ok(written.movement)
    }

    /// Soft-delete a movement and recompute the product's aggregate.
    ///
    /// Deleting an inbound movement whose quantity is already consumed would make
    /// stock negative; that deletion is rejected with `InsufficientStock`.
    pub fn delete_movement(&self, movement_id: MovementId) -> LedgerResult<Movement> {
        let original = self.live_row(movement_id)?;

        let slot = self.slot(original.product_id)?;
        let mut state = slot.lock()?;

        let mut delta = 0;
        let mut after = 0;
        let written = self.write_with_retry(&slot, &mut state, |state| {
            let current_row = self.live_row(movement_id)?;
            delta = -current_row.signed_delta();
            after = admit(state.current, delta, -delta)?;
            let written = self.store.mark_deleted(
                movement_id,
                Utc::now(),
                ExpectedVersion::Exact(state.version),
            )?;
            slot.dirty.store(true, Ordering::SeqCst);
            Ok(written)
        })?;

        self.apply_retroactive(&slot, &mut state, after, written.stream_version);
        self.metrics.delete_movement();
        info!(
            product_id = %original.product_id,
            movement_id = %movement_id,
            delta,
            "movement deleted"
        );
        self.recompute_locked(&slot, &mut state)?;

        Ok(written.movement)
    }

    /// Recompute a product's counter as a full sum over its ledger.
    ///
    /// A difference from the cached value is reported as a `ConsistencyViolation`
    /// (logged and counted) and the cache is corrected.
    pub fn recompute_aggregate(&self, product_id: ProductId) -> LedgerResult<RecomputeOutcome> {
        let slot = self.slot(product_id)?;
        let mut state = slot.lock()?;
        self.recompute_locked(&slot, &mut state)
    }

    /// Recompute every registered product; one failing product does not stop the sweep.
    pub fn recompute_all(&self) -> LedgerResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        for slot in self.all_slots()? {
            let product_id = slot.definition.id;
            let outcome = slot
                .lock()
                .and_then(|mut state| self.recompute_locked(&slot, &mut state));
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(product_id = %product_id, error = %e, "recompute failed");
                    report.failed.push(product_id);
                }
            }
        }
        Ok(report)
    }

    fn recompute_locked(&self, slot: &ProductSlot, state: &mut SlotState) -> LedgerResult<RecomputeOutcome> {
        let product_id = slot.definition.id;
        let stream = self.store.load_product(product_id)?;
        let recomputed = net_stock(&stream.movements)?;
        let cached = state.current;
        self.metrics.recompute();

        let violation = (recomputed != cached).then(|| {
            self.metrics.consistency_violation();
            error!(
                product_id = %product_id,
                cached,
                recomputed,
                drift = recomputed - cached,
                "consistency violation: cached stock diverged from ledger; correcting"
            );
            ConsistencyViolation {
                product_id,
                cached,
                recomputed,
            }
        });

        state.current = recomputed;
        state.version = stream.version;
        slot.publish(state);
        slot.dirty.store(false, Ordering::SeqCst);

        debug!(product_id = %product_id, current_stock = recomputed, "aggregate recomputed");
        Ok(RecomputeOutcome {
            product_id,
            cached,
            recomputed,
            violation,
        })
    }

    /// Run `attempt` until it succeeds, fails for a reason unrelated to a stale
    /// counter, or the retry budget is spent.
    ///
    /// A version conflict means a foreign writer advanced the stream. A rejected
    /// admission may mean the same thing (the foreign row added stock we have not
    /// seen yet), so it is only final once the counter is known to be current.
    /// Each reload is a full recompute, so drift left by the foreign write is
    /// reported as a consistency violation. Once the budget is spent the caller
    /// sees `ConcurrencyConflict`.
    fn write_with_retry<F>(&self, slot: &ProductSlot, state: &mut SlotState, mut attempt: F) -> LedgerResult<StoreWrite>
    where
        F: FnMut(&SlotState) -> LedgerResult<StoreWrite>,
    {
        let product_id = slot.definition.id;
        let mut retries = 0;
        loop {
            let err = match attempt(state) {
                Ok(written) => return Ok(written),
                Err(e) => e,
            };

            let conflict = matches!(err, LedgerError::ConcurrencyConflict(_));
            if !conflict && !matches!(err, LedgerError::InsufficientStock { .. }) {
                return Err(err);
            }
            let stream_version = self.store.load_product(product_id)?.version;
            if !conflict && stream_version == state.version {
                return Err(err);
            }

            if retries >= self.max_conflict_retries {
                warn!(product_id = %product_id, retries, error = %err, "giving up after concurrency conflicts");
                return Err(match err {
                    LedgerError::ConcurrencyConflict(_) => err,
                    other => LedgerError::ConcurrencyConflict(format!(
                        "product {product_id} kept changing after {retries} retries ({other})"
                    )),
                });
            }
            retries += 1;
            self.metrics.concurrency_retry();
            debug!(
                product_id = %product_id,
                retries,
                cached_version = state.version,
                stream_version,
                "stale ledger version; reloading"
            );

            self.recompute_locked(slot, state)?;
        }
    }

    fn apply_retroactive(&self, slot: &ProductSlot, state: &mut SlotState, after: i64, version: u64) {
        let before = state.current;
        state.current = after;
        state.version = version;
        slot.publish(state);
        warn_on_low_stock(slot, before, state.current);
    }

    fn live_row(&self, movement_id: MovementId) -> LedgerResult<Movement> {
        self.store
            .get(movement_id)?
            .filter(|m| !m.is_deleted())
            .ok_or_else(|| LedgerError::NotFound(format!("movement {movement_id}")))
    }

    fn slot(&self, product_id: ProductId) -> LedgerResult<Arc<ProductSlot>> {
        let slots = self
            .slots
            .read()
            .map_err(|_| LedgerError::Store(LedgerStoreError::Storage("catalog lock poisoned".to_string())))?;
        slots
            .get(&product_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("product {product_id}")))
    }

    fn all_slots(&self) -> LedgerResult<Vec<Arc<ProductSlot>>> {
        let slots = self
            .slots
            .read()
            .map_err(|_| LedgerError::Store(LedgerStoreError::Storage("catalog lock poisoned".to_string())))?;
        Ok(slots.values().cloned().collect())
    }
}

/// Counter value after `delta`, or the reason the change is refused: below zero
/// is `InsufficientStock`, outside the `i64` range is a validation failure.
fn admit(current: i64, delta: i64, requested: i64) -> LedgerResult<i64> {
    let after = current.checked_add(delta).ok_or_else(|| {
        LedgerError::Validation(format!("stock would overflow ({current} + {delta})"))
    })?;
    if after < 0 {
        return Err(DomainError::insufficient_stock(requested, current).into());
    }
    Ok(after)
}

fn warn_on_low_stock(slot: &ProductSlot, before: i64, after: i64) {
    let min = slot.definition.min_stock;
    if after <= min && before > min {
        warn!(
            product_id = %slot.definition.id,
            current_stock = after,
            min_stock = min,
            "stock at or below minimum"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use proptest::prelude::*;

    use crate::ledger_store::InMemoryLedgerStore;
    use stockledger_inventory::{MovementDetails, StockInDetails, StockOutDetails};

    type Service = AggregateService<Arc<InMemoryLedgerStore>>;

    fn setup() -> (Arc<Service>, Arc<InMemoryLedgerStore>, Arc<EngineMetrics>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let service = Arc::new(AggregateService::new(store.clone(), metrics.clone(), 3));
        (service, store, metrics)
    }

    fn register(service: &Service, min_stock: i64) -> ProductId {
        let id = ProductId::new();
        service
            .register_product(NewProduct {
                id,
                name: "Sugar".to_string(),
                unit: "kg".to_string(),
                min_stock,
            })
            .unwrap();
        id
    }

    fn stock_in(product_id: ProductId, quantity: i64) -> NewMovement {
        NewMovement::stock_in(product_id, quantity, Utc::now(), StockInDetails::default())
    }

    fn stock_out(product_id: ProductId, quantity: i64) -> NewMovement {
        NewMovement::stock_out(product_id, quantity, Utc::now(), StockOutDetails::default())
    }

    fn ledger_sum(store: &InMemoryLedgerStore, product_id: ProductId) -> i64 {
        net_stock(&store.load_product(product_id).unwrap().movements).unwrap()
    }

    #[test]
    fn in_and_out_update_the_counter() {
        let (service, store, _) = setup();
        let p = register(&service, 0);

        service.record_movement(stock_in(p, 50)).unwrap();
        service.record_movement(stock_out(p, 20)).unwrap();

        assert_eq!(service.current_stock(p).unwrap(), 30);
        assert_eq!(ledger_sum(&store, p), 30);
    }

    #[test]
    fn oversell_is_rejected_and_leaves_state_untouched() {
        let (service, store, metrics) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 10)).unwrap();

        let err = service.record_movement(stock_out(p, 11)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientStock {
                requested: 11,
                available: 10
            }
        ));
        assert_eq!(service.current_stock(p).unwrap(), 10);
        assert_eq!(store.load_product(p).unwrap().movements.len(), 1);
        assert_eq!(metrics.snapshot().movements_rejected, 1);
    }

    #[test]
    fn non_positive_quantity_is_a_validation_error() {
        let (service, _, _) = setup();
        let p = register(&service, 0);
        assert!(matches!(
            service.record_movement(stock_in(p, 0)),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            service.record_movement(stock_out(p, -3)),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn unknown_product_and_movement_are_not_found() {
        let (service, _, _) = setup();
        assert!(matches!(
            service.record_movement(stock_in(ProductId::new(), 1)),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_movement(MovementId::new()),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            service.edit_movement(
                MovementId::new(),
                MovementPatch {
                    quantity: Some(1),
                    ..Default::default()
                }
            ),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let (service, _, _) = setup();
        let p = register(&service, 0);
        let err = service
            .register_product(NewProduct {
                id: p,
                name: "Again".to_string(),
                unit: "kg".to_string(),
                min_stock: 0,
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[test]
    fn deleting_an_in_movement_reduces_stock() {
        let (service, _, _) = setup();
        let p = register(&service, 0);
        let first = service.record_movement(stock_in(p, 40)).unwrap();
        service.record_movement(stock_in(p, 25)).unwrap();

        service.delete_movement(first.id).unwrap();
        assert_eq!(service.current_stock(p).unwrap(), 25);
        assert!(matches!(
            service.movement(first.id),
            Err(LedgerError::NotFound(_))
        ));
        assert!(service.dirty_products().unwrap().is_empty());
    }

    #[test]
    fn deleting_a_consumed_in_movement_is_rejected() {
        let (service, store, _) = setup();
        let p = register(&service, 0);
        let inbound = service.record_movement(stock_in(p, 30)).unwrap();
        service.record_movement(stock_out(p, 20)).unwrap();

        let err = service.delete_movement(inbound.id).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientStock {
                requested: 30,
                available: 10
            }
        ));
        assert_eq!(service.current_stock(p).unwrap(), 10);
        assert!(!store.get(inbound.id).unwrap().unwrap().is_deleted());
        assert!(service.dirty_products().unwrap().is_empty());
    }

    #[test]
    fn editing_quantity_recomputes_without_violation() {
        let (service, _, metrics) = setup();
        let p = register(&service, 0);
        let out = {
            service.record_movement(stock_in(p, 100)).unwrap();
            service.record_movement(stock_out(p, 30)).unwrap()
        };

        let edited = service
            .edit_movement(
                out.id,
                MovementPatch {
                    quantity: Some(45),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(edited.quantity, 45);
        assert_eq!(edited.sequence, out.sequence);
        assert_eq!(service.current_stock(p).unwrap(), 55);
        let snap = metrics.snapshot();
        assert_eq!(snap.movements_edited, 1);
        assert_eq!(snap.consistency_violations, 0);
    }

    #[test]
    fn edit_that_would_oversell_is_rejected() {
        let (service, _, _) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 10)).unwrap();
        let out = service.record_movement(stock_out(p, 5)).unwrap();

        let err = service
            .edit_movement(
                out.id,
                MovementPatch {
                    quantity: Some(12),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(service.current_stock(p).unwrap(), 5);
    }

    #[test]
    fn bad_patch_is_a_validation_error() {
        let (service, _, _) = setup();
        let p = register(&service, 0);
        let inbound = service.record_movement(stock_in(p, 10)).unwrap();

        for patch in [
            MovementPatch::default(),
            MovementPatch {
                quantity: Some(0),
                ..Default::default()
            },
            MovementPatch {
                details: Some(MovementDetails::Out(StockOutDetails::default())),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                service.edit_movement(inbound.id, patch),
                Err(LedgerError::Validation(_))
            ));
        }
    }

    #[test]
    fn recompute_detects_and_corrects_drift() {
        let (service, store, metrics) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 10)).unwrap();

        // A write that bypasses the service leaves the cache stale.
        store
            .append(
                Movement::record(MovementId::new(), stock_in(p, 7), Utc::now()).unwrap(),
                ExpectedVersion::Any,
            )
            .unwrap();

        let outcome = service.recompute_aggregate(p).unwrap();
        let violation = outcome.violation.unwrap();
        assert_eq!(violation.cached, 10);
        assert_eq!(violation.recomputed, 17);
        assert_eq!(service.current_stock(p).unwrap(), 17);
        assert_eq!(metrics.snapshot().consistency_violations, 1);

        let clean = service.recompute_aggregate(p).unwrap();
        assert!(clean.violation.is_none());
    }

    #[test]
    fn foreign_writer_triggers_reload_and_retry() {
        let (service, store, metrics) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 5)).unwrap();

        store
            .append(
                Movement::record(MovementId::new(), stock_in(p, 20), Utc::now()).unwrap(),
                ExpectedVersion::Any,
            )
            .unwrap();

        // Admission must see the foreign row: 25 available after reload.
        service.record_movement(stock_out(p, 22)).unwrap();
        assert_eq!(service.current_stock(p).unwrap(), 3);
        assert_eq!(ledger_sum(&store, p), 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.concurrency_retries, 1);
        assert_eq!(snap.consistency_violations, 1);
    }

    #[test]
    fn drift_found_on_reload_is_reported() {
        let (service, store, metrics) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 5)).unwrap();
        store
            .append(
                Movement::record(MovementId::new(), stock_in(p, 20), Utc::now()).unwrap(),
                ExpectedVersion::Any,
            )
            .unwrap();

        // The append conflicts on version; the reload notices the cache was 5, not 25.
        service.record_movement(stock_in(p, 1)).unwrap();
        assert_eq!(service.current_stock(p).unwrap(), 26);
        let snap = metrics.snapshot();
        assert_eq!(snap.concurrency_retries, 1);
        assert_eq!(snap.consistency_violations, 1);

        let outcome = service.recompute_aggregate(p).unwrap();
        assert!(outcome.violation.is_none());
        assert_eq!(metrics.snapshot().consistency_violations, 1);
    }

    #[test]
    fn exhausted_retries_surface_as_concurrency_conflict() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let service = AggregateService::new(store.clone(), Arc::new(EngineMetrics::new()), 0);
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 5)).unwrap();
        store
            .append(
                Movement::record(MovementId::new(), stock_in(p, 20), Utc::now()).unwrap(),
                ExpectedVersion::Any,
            )
            .unwrap();

        // Rejected against the stale counter, with no retry budget to reload.
        let err = service.record_movement(stock_out(p, 10)).unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
        let err = service.record_movement(stock_in(p, 1)).unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
        assert_eq!(ledger_sum(&store, p), 25);
    }

    #[test]
    fn overflowing_stock_in_is_rejected_without_poisoning_the_product() {
        let (service, store, metrics) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, i64::MAX)).unwrap();

        let err = service.record_movement(stock_in(p, 1)).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(service.current_stock(p).unwrap(), i64::MAX);
        assert_eq!(store.load_product(p).unwrap().movements.len(), 1);
        assert_eq!(metrics.snapshot().movements_rejected, 1);

        // The product stays writable.
        service.record_movement(stock_out(p, 1)).unwrap();
        assert_eq!(service.current_stock(p).unwrap(), i64::MAX - 1);
        assert_eq!(ledger_sum(&store, p), i64::MAX - 1);
    }

    /// Ledger store whose edits and deletes fail with a storage error.
    struct FailingEdits(InMemoryLedgerStore);

    impl LedgerStore for FailingEdits {
        fn append(&self, movement: Movement, expected_version: ExpectedVersion) -> Result<StoreWrite, LedgerStoreError> {
            self.0.append(movement, expected_version)
        }

        fn replace(&self, _movement: Movement, _expected_version: ExpectedVersion) -> Result<StoreWrite, LedgerStoreError> {
            Err(LedgerStoreError::Storage("disk full".to_string()))
        }

        fn mark_deleted(
            &self,
            _movement_id: MovementId,
            _deleted_at: chrono::DateTime<Utc>,
            _expected_version: ExpectedVersion,
        ) -> Result<StoreWrite, LedgerStoreError> {
            Err(LedgerStoreError::Storage("disk full".to_string()))
        }

        fn get(&self, movement_id: MovementId) -> Result<Option<Movement>, LedgerStoreError> {
            self.0.get(movement_id)
        }

        fn load_product(&self, product_id: ProductId) -> Result<crate::ledger_store::ProductStream, LedgerStoreError> {
            self.0.load_product(product_id)
        }
    }

    #[test]
    fn failed_retroactive_write_leaves_product_clean() {
        let service = AggregateService::new(
            FailingEdits(InMemoryLedgerStore::new()),
            Arc::new(EngineMetrics::new()),
            3,
        );
        let p = ProductId::new();
        service
            .register_product(NewProduct {
                id: p,
                name: "Rice".to_string(),
                unit: "kg".to_string(),
                min_stock: 0,
            })
            .unwrap();
        let inbound = service.record_movement(stock_in(p, 10)).unwrap();

        let err = service
            .edit_movement(
                inbound.id,
                MovementPatch {
                    quantity: Some(12),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Store(LedgerStoreError::Storage(_))));
        assert!(matches!(
            service.delete_movement(inbound.id),
            Err(LedgerError::Store(LedgerStoreError::Storage(_)))
        ));

        assert!(service.dirty_products().unwrap().is_empty());
        assert_eq!(service.current_stock(p).unwrap(), 10);
    }

    #[test]
    fn register_seeds_counter_from_existing_ledger() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let p = ProductId::new();
        store
            .append(
                Movement::record(MovementId::new(), stock_in(p, 12), Utc::now()).unwrap(),
                ExpectedVersion::Any,
            )
            .unwrap();

        let service = AggregateService::new(store, Arc::new(EngineMetrics::new()), 3);
        let product = service
            .register_product(NewProduct {
                id: p,
                name: "Salt".to_string(),
                unit: "kg".to_string(),
                min_stock: 0,
            })
            .unwrap();
        assert_eq!(product.current_stock(), 12);
    }

    #[test]
    fn low_stock_listing() {
        let (service, _, _) = setup();
        let low = register(&service, 10);
        let ok = register(&service, 10);
        service.record_movement(stock_in(low, 8)).unwrap();
        service.record_movement(stock_in(ok, 30)).unwrap();

        let ids: Vec<ProductId> = service
            .low_stock_products()
            .unwrap()
            .iter()
            .map(Product::id)
            .collect();
        assert_eq!(ids, vec![low]);
    }

    #[test]
    fn concurrent_outs_never_oversell() {
        let (service, store, _) = setup();
        let p = register(&service, 0);
        service.record_movement(stock_in(p, 100)).unwrap();

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let service = service.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    // Quantities 5..=20 sum to 200, twice the stock.
                    let quantity = 5 + i as i64;
                    service
                        .record_movement(stock_out(p, quantity))
                        .ok()
                        .map(|m| m.quantity)
                })
            })
            .collect();

        let admitted: i64 = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .sum();

        assert!(admitted <= 100);
        let current = service.current_stock(p).unwrap();
        assert_eq!(current, 100 - admitted);
        assert!(current >= 0);
        assert_eq!(ledger_sum(&store, p), current);
    }

    #[test]
    fn different_products_progress_independently() {
        let (service, _, _) = setup();
        let products: Vec<ProductId> = (0..8).map(|_| register(&service, 0)).collect();

        let handles: Vec<_> = products
            .iter()
            .map(|&p| {
                let service = service.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        service.record_movement(stock_in(p, 2)).unwrap();
                        service.record_movement(stock_out(p, 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for p in products {
            assert_eq!(service.current_stock(p).unwrap(), 50);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        In(i64),
        Out(i64),
        Edit(usize, i64),
        Delete(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50).prop_map(Op::In),
            (1i64..50).prop_map(Op::Out),
            (any::<usize>(), 1i64..50).prop_map(|(i, q)| Op::Edit(i, q)),
            any::<usize>().prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: after every operation (accepted or rejected) the counter equals
        /// Σ In − Σ Out over live rows and is never negative.
        #[test]
        fn counter_always_matches_ledger(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let (service, store, metrics) = setup();
            let p = register(&service, 0);
            let mut ids: Vec<MovementId> = Vec::new();

            for op in ops {
                let _ = match op {
                    Op::In(q) => service.record_movement(stock_in(p, q)).map(|m| ids.push(m.id)),
                    Op::Out(q) => service.record_movement(stock_out(p, q)).map(|m| ids.push(m.id)),
                    Op::Edit(i, q) if !ids.is_empty() => service
                        .edit_movement(ids[i % ids.len()], MovementPatch { quantity: Some(q), ..Default::default() })
                        .map(|_| ()),
                    Op::Delete(i) if !ids.is_empty() => service
                        .delete_movement(ids[i % ids.len()])
                        .map(|_| ()),
                    _ => Ok(()),
                };

                let current = service.current_stock(p).unwrap();
                prop_assert_eq!(current, ledger_sum(&store, p));
                prop_assert!(current >= 0);
            }

            prop_assert_eq!(metrics.snapshot().consistency_violations, 0);
        }
    }
}
