//! Remaining-stock projection for historical outbound rows.
//!
//! Given the current aggregate `C` and the outbound movements of one product
//! listed most-recent-first, the stock left right after row `i` is
//! `C + Σ quantity[0..i]` (exclusive of `i`), so row 0 always shows `C`.
//!
//! The values are only meaningful when computed over the *complete* ordered set
//! of outbound rows. Paginated callers must project first and slice afterwards.

use std::cmp::Ordering;
use std::collections::HashMap;

use stockledger_core::MovementId;

use crate::movement::{Movement, MovementKind};

/// Most-recent-first ordering: later timestamp first, and for equal timestamps the
/// later insertion (higher sequence) first.
pub fn recency_order(a: &Movement, b: &Movement) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.sequence.cmp(&a.sequence))
}

/// Running remaining-stock values for quantities already ordered most-recent-first.
pub fn remaining_after<I>(current_stock: i64, quantities_desc: I) -> Vec<i64>
where
    I: IntoIterator<Item = i64>,
{
    let mut running = current_stock;
    quantities_desc
        .into_iter()
        .map(|quantity| {
            let remaining = running;
            running = running.saturating_add(quantity);
            remaining
        })
        .collect()
}

/// Remaining stock keyed by movement id, for every live outbound row in `movements`.
///
/// Inbound and deleted rows are ignored. Input order does not matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemainingStock {
    by_movement: HashMap<MovementId, i64>,
}

impl RemainingStock {
    pub fn project<'a, I>(current_stock: i64, movements: I) -> Self
    where
        I: IntoIterator<Item = &'a Movement>,
    {
        let mut outs: Vec<&Movement> = movements
            .into_iter()
            .filter(|m| m.kind() == MovementKind::Out && !m.is_deleted())
            .collect();
        outs.sort_by(|a, b| recency_order(a, b));

        let values = remaining_after(current_stock, outs.iter().map(|m| m.quantity));
        let by_movement = outs.iter().map(|m| m.id).zip(values).collect();

        Self { by_movement }
    }

    pub fn get(&self, movement_id: &MovementId) -> Option<i64> {
        self.by_movement.get(movement_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_movement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_movement.is_empty()
    }
}
