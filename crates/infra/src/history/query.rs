//! Movement history query types.
//!
//! Date bounds are local business dates; they are turned into UTC instants only
//! through the engine's [`BusinessCalendar`].

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockledger_core::{BusinessCalendar, DomainError, DomainResult, ProductId};
use stockledger_inventory::{Movement, MovementDetails, MovementKind, recency_order};

/// Filter criteria for history and export queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    /// Restrict to one product (all registered products otherwise).
    pub product_id: Option<ProductId>,
    pub kind: Option<MovementKind>,
    /// First local business date included.
    pub from: Option<NaiveDate>,
    /// Last local business date included.
    pub to: Option<NaiveDate>,
    /// Case-insensitive substring of the supplier (In rows only).
    pub supplier: Option<String>,
    /// Case-insensitive substring of the department (Out rows only).
    pub department: Option<String>,
}

impl MovementFilter {
    pub fn for_product(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: MovementKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(DomainError::validation(format!(
                    "date range is inverted ({from} > {to})"
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, movement: &Movement, calendar: &BusinessCalendar) -> bool {
        if movement.is_deleted() {
            return false;
        }
        if self.product_id.is_some_and(|p| p != movement.product_id) {
            return false;
        }
        if self.kind.is_some_and(|k| k != movement.kind()) {
            return false;
        }
        if !calendar.contains(self.from, self.to, movement.timestamp) {
            return false;
        }

        let supplier = needle(self.supplier.as_deref());
        let department = needle(self.department.as_deref());
        match &movement.details {
            MovementDetails::In(details) => {
                department.is_none() && contains_ci(supplier, details.supplier.as_deref())
            }
            MovementDetails::Out(details) => {
                supplier.is_none() && contains_ci(department, details.department.as_deref())
            }
        }
    }
}

/// A blank search term filters nothing.
fn needle(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|n| !n.is_empty())
}

fn contains_ci(needle: Option<&str>, haystack: Option<&str>) -> bool {
    match (needle, haystack) {
        (None, _) => true,
        (Some(needle), Some(haystack)) => haystack
            .to_lowercase()
            .contains(&needle.to_lowercase()),
        (Some(_), None) => false,
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Timestamp,
    Quantity,
    InsertedAt,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortBy {
    /// Ascending comparison; ties fall back to time, then insertion order.
    fn ascending(self, a: &Movement, b: &Movement) -> Ordering {
        let primary = match self {
            SortBy::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortBy::Quantity => a.quantity.cmp(&b.quantity),
            SortBy::InsertedAt => a.inserted_at.cmp(&b.inserted_at),
        };
        primary.then_with(|| recency_order(b, a))
    }
}

/// Sort rows in place.
pub fn sort_movements(rows: &mut [Movement], sort_by: SortBy, order: SortOrder) {
    rows.sort_by(|a, b| match order {
        SortOrder::Asc => sort_by.ascending(a, b),
        SortOrder::Desc => sort_by.ascending(b, a),
    });
}

/// Requested page (1-based). A missing page size means the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: Option<usize>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: None,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl PageRequest {
    pub fn page(page: u32, page_size: usize) -> Self {
        Self {
            page,
            page_size: Some(page_size),
            ..Self::default()
        }
    }

    pub fn sorted(mut self, sort_by: SortBy, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.sort_order = sort_order;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl Pagination {
    /// `page` below 1 is treated as 1; `limit` is clamped to `1..=max_limit`.
    pub fn new(page: u32, limit: usize, max_limit: usize, total: usize) -> Self {
        let limit = limit.clamp(1, max_limit.max(1));
        Self {
            page: page.max(1),
            limit,
            total,
            total_pages: total.div_ceil(limit),
        }
    }

    /// Index range of this page within the full result set.
    pub fn window(&self) -> std::ops::Range<usize> {
        let start = (self.page.max(1) as usize - 1)
            .saturating_mul(self.limit)
            .min(self.total);
        let end = start.saturating_add(self.limit).min(self.total);
        start..end
    }
}

/// One history row as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovementView {
    #[serde(flatten)]
    pub movement: Movement,
    /// Stock left right after this row (Out rows only).
    pub remaining_stock: Option<i64>,
    /// Business date of `movement.timestamp`.
    pub local_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovementPage {
    pub items: Vec<MovementView>,
    pub pagination: Pagination,
}

/// Per-product totals for one local business date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyMovementSummary {
    pub date: NaiveDate,
    pub product_id: ProductId,
    pub stock_in: i64,
    pub stock_out: i64,
    pub movements: usize,
}

impl DailyMovementSummary {
    pub fn net(&self) -> i64 {
        self.stock_in.saturating_sub(self.stock_out)
    }
}
