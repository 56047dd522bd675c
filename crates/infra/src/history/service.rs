//! Read path over the ledger: paginated history, export and daily totals.
//!
//! Reads never take a product's write lock. The remaining-stock projection is
//! computed over each product's complete Out history before any filtering,
//! sorting or paging, so a row shows the same value on every page and under
//! every sort.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use stockledger_core::{BusinessCalendar, ProductId};
use stockledger_inventory::{Movement, MovementKind, RemainingStock};

use super::query::{
    DailyMovementSummary, MovementFilter, MovementPage, MovementView, PageRequest, Pagination,
    SortBy, SortOrder, sort_movements,
};
use crate::aggregate_service::{AggregateService, LedgerResult};
use crate::ledger_store::LedgerStore;

pub struct HistoryService<S> {
    aggregates: Arc<AggregateService<S>>,
    calendar: BusinessCalendar,
    default_page_size: usize,
    max_page_size: usize,
}

impl<S: LedgerStore> HistoryService<S> {
    pub fn new(
        aggregates: Arc<AggregateService<S>>,
        calendar: BusinessCalendar,
        default_page_size: usize,
        max_page_size: usize,
    ) -> Self {
        Self {
            aggregates,
            calendar,
            default_page_size,
            max_page_size,
        }
    }

    pub fn calendar(&self) -> BusinessCalendar {
        self.calendar
    }

    /// One page of matching movements.
    pub fn movements(&self, filter: &MovementFilter, request: PageRequest) -> LedgerResult<MovementPage> {
        let (mut rows, projections) = self.collect(filter)?;
        sort_movements(&mut rows, request.sort_by, request.sort_order);

        let pagination = Pagination::new(
            request.page,
            request.page_size.unwrap_or(self.default_page_size),
            self.max_page_size,
            rows.len(),
        );
        let items = rows
            .drain(pagination.window())
            .map(|m| self.view(m, &projections))
            .collect();

        debug!(
            product_id = ?filter.product_id,
            page = pagination.page,
            total = pagination.total,
            "history page served"
        );
        Ok(MovementPage { items, pagination })
    }

    /// Every matching movement, most recent first.
    pub fn export(&self, filter: &MovementFilter) -> LedgerResult<Vec<MovementView>> {
        let (mut rows, projections) = self.collect(filter)?;
        sort_movements(&mut rows, SortBy::Timestamp, SortOrder::Desc);
        Ok(rows
            .into_iter()
            .map(|m| self.view(m, &projections))
            .collect())
    }

    /// Totals per local business date and product, oldest date first.
    pub fn daily_summary(&self, filter: &MovementFilter) -> LedgerResult<Vec<DailyMovementSummary>> {
        let (rows, _) = self.collect(filter)?;

        let mut days: BTreeMap<(chrono::NaiveDate, ProductId), DailyMovementSummary> = BTreeMap::new();
        for m in rows {
            let date = self.calendar.local_date(m.timestamp);
            let entry = days
                .entry((date, m.product_id))
                .or_insert_with(|| DailyMovementSummary {
                    date,
                    product_id: m.product_id,
                    stock_in: 0,
                    stock_out: 0,
                    movements: 0,
                });
            match m.kind() {
                MovementKind::In => entry.stock_in = entry.stock_in.saturating_add(m.quantity),
                MovementKind::Out => entry.stock_out = entry.stock_out.saturating_add(m.quantity),
            }
            entry.movements += 1;
        }
        Ok(days.into_values().collect())
    }

    /// Matching live rows plus the full-history projection of each product they
    /// belong to.
    fn collect(&self, filter: &MovementFilter) -> LedgerResult<(Vec<Movement>, HashMap<ProductId, RemainingStock>)> {
        filter.validate()?;

        let products = match filter.product_id {
            Some(id) => vec![id],
            None => self.aggregates.product_ids()?,
        };

        let mut rows = Vec::new();
        let mut projections = HashMap::with_capacity(products.len());
        for product_id in products {
            let live = self.aggregates.live_movements(product_id)?;
            let current = self.aggregates.current_stock(product_id)?;
            projections.insert(product_id, RemainingStock::project(current, &live));
            rows.extend(
                live.into_iter()
                    .filter(|m| filter.matches(m, &self.calendar)),
            );
        }
        Ok((rows, projections))
    }

    fn view(&self, movement: Movement, projections: &HashMap<ProductId, RemainingStock>) -> MovementView {
        let remaining_stock = projections
            .get(&movement.product_id)
            .and_then(|p| p.get(&movement.id));
        MovementView {
            local_date: self.calendar.local_date(movement.timestamp),
            remaining_stock,
            movement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    use stockledger_core::MovementId;
    use stockledger_inventory::{NewMovement, NewProduct, StockInDetails, StockOutDetails};
    use stockledger_observability::EngineMetrics;

    use crate::aggregate_service::LedgerError;
    use crate::ledger_store::InMemoryLedgerStore;

    type Service = AggregateService<Arc<InMemoryLedgerStore>>;

    fn setup(offset: &str) -> (Arc<Service>, HistoryService<Arc<InMemoryLedgerStore>>) {
        let aggregates = Arc::new(AggregateService::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(EngineMetrics::new()),
            3,
        ));
        let history = HistoryService::new(
            aggregates.clone(),
            BusinessCalendar::parse(offset).unwrap(),
            50,
            100,
        );
        (aggregates, history)
    }

    fn product(aggregates: &Service) -> ProductId {
        let id = ProductId::new();
        aggregates
            .register_product(NewProduct {
                id,
                name: "Rice".to_string(),
                unit: "kg".to_string(),
                min_stock: 0,
            })
            .unwrap();
        id
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn record_in(aggregates: &Service, p: ProductId, quantity: i64, minutes: i64, supplier: &str) -> MovementId {
        aggregates
            .record_movement(NewMovement::stock_in(
                p,
                quantity,
                at(minutes),
                StockInDetails {
                    supplier: Some(supplier.to_string()),
                    ..StockInDetails::default()
                },
            ))
            .unwrap()
            .id
    }

    fn record_out(aggregates: &Service, p: ProductId, quantity: i64, minutes: i64) -> MovementId {
        aggregates
            .record_movement(NewMovement::stock_out(
                p,
                quantity,
                at(minutes),
                StockOutDetails {
                    department: Some("Kitchen".to_string()),
                    ..StockOutDetails::default()
                },
            ))
            .unwrap()
            .id
    }

    #[test]
    fn out_rows_carry_remaining_stock() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        record_in(&aggregates, p, 80, 0, "Acme");
        let oldest = record_out(&aggregates, p, 15, 10);
        let middle = record_out(&aggregates, p, 10, 20);
        let newest = record_out(&aggregates, p, 5, 30);
        assert_eq!(aggregates.current_stock(p).unwrap(), 50);

        let rows = history
            .export(&MovementFilter::for_product(p).with_kind(MovementKind::Out))
            .unwrap();
        let remaining: Vec<(MovementId, Option<i64>)> = rows
            .iter()
            .map(|r| (r.movement.id, r.remaining_stock))
            .collect();
        assert_eq!(
            remaining,
            vec![(newest, Some(50)), (middle, Some(55)), (oldest, Some(65))]
        );
    }

    #[test]
    fn projection_is_independent_of_page_and_sort() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        record_in(&aggregates, p, 1000, 0, "Acme");
        let outs: Vec<MovementId> = (1..=12).map(|i| record_out(&aggregates, p, i, i)).collect();

        let full: HashMap<MovementId, Option<i64>> = history
            .export(&MovementFilter::for_product(p))
            .unwrap()
            .into_iter()
            .map(|r| (r.movement.id, r.remaining_stock))
            .collect();

        for (sort_by, order) in [
            (SortBy::Timestamp, SortOrder::Desc),
            (SortBy::Quantity, SortOrder::Asc),
            (SortBy::InsertedAt, SortOrder::Asc),
        ] {
            for page in 1..=3 {
                let result = history
                    .movements(
                        &MovementFilter::for_product(p).with_kind(MovementKind::Out),
                        PageRequest::page(page, 5).sorted(sort_by, order),
                    )
                    .unwrap();
                assert_eq!(result.pagination.total, outs.len());
                assert_eq!(result.pagination.total_pages, 3);
                for item in result.items {
                    assert_eq!(Some(&item.remaining_stock), full.get(&item.movement.id));
                }
            }
        }
    }

    #[test]
    fn in_rows_have_no_remaining_stock() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        record_in(&aggregates, p, 10, 0, "Acme");

        let rows = history.export(&MovementFilter::for_product(p)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].remaining_stock, None);
    }

    #[test]
    fn deleted_rows_leave_history_and_export() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        record_in(&aggregates, p, 10, 0, "Acme");
        let gone = record_out(&aggregates, p, 4, 5);
        aggregates.delete_movement(gone).unwrap();

        let rows = history.export(&MovementFilter::for_product(p)).unwrap();
        assert!(rows.iter().all(|r| r.movement.id != gone));
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn page_size_is_clamped_and_sorted() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        for i in 0..5 {
            record_in(&aggregates, p, 10 - i, i, "Acme");
        }

        let page = history
            .movements(
                &MovementFilter::for_product(p),
                PageRequest::page(1, 10_000).sorted(SortBy::Quantity, SortOrder::Asc),
            )
            .unwrap();
        assert_eq!(page.pagination.limit, 100);
        let quantities: Vec<i64> = page.items.iter().map(|i| i.movement.quantity).collect();
        assert_eq!(quantities, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn supplier_filter_and_all_products() {
        let (aggregates, history) = setup("Z");
        let a = product(&aggregates);
        let b = product(&aggregates);
        record_in(&aggregates, a, 5, 0, "Acme Mills");
        record_in(&aggregates, b, 7, 0, "Northern Grain");
        record_out(&aggregates, b, 2, 1);

        let filter = MovementFilter {
            supplier: Some("grain".to_string()),
            ..MovementFilter::default()
        };
        let rows = history.export(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].movement.product_id, b);

        assert_eq!(history.export(&MovementFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn local_midnight_boundary_is_classified_by_business_date() {
        let (aggregates, history) = setup("+05:30");
        let p = product(&aggregates);
        let instant = Utc.with_ymd_and_hms(2024, 12, 31, 18, 45, 0).unwrap();
        aggregates
            .record_movement(NewMovement::stock_in(p, 3, instant, StockInDetails::default()))
            .unwrap();

        let new_year = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let eve = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();

        let hits = history
            .export(&MovementFilter::for_product(p).between(new_year, new_year))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].local_date, new_year);

        let misses = history
            .export(&MovementFilter::for_product(p).between(eve, eve))
            .unwrap();
        assert!(misses.is_empty());

        let summary = history.daily_summary(&MovementFilter::for_product(p)).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].date, new_year);
        assert_eq!(summary[0].net(), 3);
    }

    #[test]
    fn daily_summary_groups_per_date() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        record_in(&aggregates, p, 20, 0, "Acme");
        record_out(&aggregates, p, 5, 10);
        aggregates
            .record_movement(NewMovement::stock_out(
                p,
                4,
                at(60 * 24),
                StockOutDetails::default(),
            ))
            .unwrap();

        let summary = history.daily_summary(&MovementFilter::for_product(p)).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!((summary[0].stock_in, summary[0].stock_out, summary[0].movements), (20, 5, 2));
        assert_eq!(summary[1].stock_out, 4);
    }

    #[test]
    fn bad_queries_fail() {
        let (aggregates, history) = setup("Z");
        let p = product(&aggregates);
        let inverted = MovementFilter::for_product(p).between(
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        );
        assert!(matches!(history.export(&inverted), Err(LedgerError::Validation(_))));
        assert!(matches!(
            history.export(&MovementFilter::for_product(ProductId::new())),
            Err(LedgerError::NotFound(_))
        ));
    }
}
