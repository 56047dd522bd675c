use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, MovementId, ProductId};

/// Direction of a stock movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    In,
    Out,
}

impl MovementKind {
    /// Contribution of `quantity` units of this kind to the stock aggregate.
    pub fn signed(self, quantity: i64) -> i64 {
        match self {
            MovementKind::In => quantity,
            MovementKind::Out => -quantity,
        }
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            MovementKind::In => "in",
            MovementKind::Out => "out",
        })
    }
}

/// Receiving metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockInDetails {
    pub supplier: Option<String>,
    pub invoice_number: Option<String>,
    pub location: Option<String>,
}

/// Issue metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOutDetails {
    pub department: Option<String>,
    pub issued_by: Option<String>,
    pub received_by: Option<String>,
    pub purpose: Option<String>,
}

/// Variant-specific metadata; the variant also fixes the movement kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MovementDetails {
    In(StockInDetails),
    Out(StockOutDetails),
}

impl MovementDetails {
    pub fn kind(&self) -> MovementKind {
        match self {
            MovementDetails::In(_) => MovementKind::In,
            MovementDetails::Out(_) => MovementKind::Out,
        }
    }

    /// Trim free-text fields and drop the blank ones.
    fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }

        match self {
            MovementDetails::In(d) => MovementDetails::In(StockInDetails {
                supplier: clean(d.supplier),
                invoice_number: clean(d.invoice_number),
                location: clean(d.location),
            }),
            MovementDetails::Out(d) => MovementDetails::Out(StockOutDetails {
                department: clean(d.department),
                issued_by: clean(d.issued_by),
                received_by: clean(d.received_by),
                purpose: clean(d.purpose),
            }),
        }
    }
}

/// A movement request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Business-relevant moment, as a UTC instant.
    pub timestamp: DateTime<Utc>,
    pub details: MovementDetails,
}

impl NewMovement {
    pub fn stock_in(
        product_id: ProductId,
        quantity: i64,
        timestamp: DateTime<Utc>,
        details: StockInDetails,
    ) -> Self {
        Self {
            product_id,
            quantity,
            timestamp,
            details: MovementDetails::In(details),
        }
    }

    pub fn stock_out(
        product_id: ProductId,
        quantity: i64,
        timestamp: DateTime<Utc>,
        details: StockOutDetails,
    ) -> Self {
        Self {
            product_id,
            quantity,
            timestamp,
            details: MovementDetails::Out(details),
        }
    }

    pub fn kind(&self) -> MovementKind {
        self.details.kind()
    }

    pub fn signed_delta(&self) -> i64 {
        self.kind().signed(self.quantity)
    }

    pub fn validate(&self) -> DomainResult<()> {
        ensure_positive(self.quantity)
    }
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub quantity: i64,
    /// Canonical business timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// System clock at insertion.
    pub inserted_at: DateTime<Utc>,
    /// Store-assigned insertion order; breaks ties between equal timestamps.
    pub sequence: u64,
    /// Soft-delete marker. Deleted rows never count towards stock.
    pub deleted_at: Option<DateTime<Utc>>,
    pub details: MovementDetails,
}

impl Movement {
    /// Validate a request and turn it into an unsequenced ledger row.
    pub fn record(id: MovementId, new: NewMovement, inserted_at: DateTime<Utc>) -> DomainResult<Self> {
        new.validate()?;
        Ok(Self {
            id,
            product_id: new.product_id,
            quantity: new.quantity,
            timestamp: new.timestamp,
            inserted_at,
            sequence: 0,
            deleted_at: None,
            details: new.details.normalized(),
        })
    }

    pub fn kind(&self) -> MovementKind {
        self.details.kind()
    }

    pub fn signed_delta(&self) -> i64 {
        self.kind().signed(self.quantity)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Retroactive edit of an existing movement. Kind and product are fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPatch {
    pub quantity: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub details: Option<MovementDetails>,
}

impl MovementPatch {
    pub fn is_empty(&self) -> bool {
        self.quantity.is_none() && self.timestamp.is_none() && self.details.is_none()
    }

    /// Produce the edited row, leaving `original` untouched.
    pub fn apply_to(&self, original: &Movement) -> DomainResult<Movement> {
        if self.is_empty() {
            return Err(DomainError::validation("patch has no changes"));
        }

        let mut edited = original.clone();

        if let Some(quantity) = self.quantity {
            ensure_positive(quantity)?;
            edited.quantity = quantity;
        }

        if let Some(timestamp) = self.timestamp {
            edited.timestamp = timestamp;
        }

        if let Some(details) = &self.details {
            if details.kind() != original.kind() {
                return Err(DomainError::validation(format!(
                    "cannot change movement kind from {} to {}",
                    original.kind(),
                    details.kind()
                )));
            }
            edited.details = details.clone().normalized();
        }

        Ok(edited)
    }
}

/// Net stock over a set of ledger rows: Σ In − Σ Out, deleted rows excluded.
///
/// Fails with `InvariantViolation` if the running sum leaves the `i64` range.
pub fn net_stock<'a, I>(movements: I) -> DomainResult<i64>
where
    I: IntoIterator<Item = &'a Movement>,
{
    movements
        .into_iter()
        .filter(|m| !m.is_deleted())
        .try_fold(0i64, |sum, m| {
            sum.checked_add(m.signed_delta())
                .ok_or_else(|| DomainError::invariant(format!("net stock overflows at movement {}", m.id)))
        })
}

fn ensure_positive(quantity: i64) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::validation(format!(
            "quantity must be positive (got {quantity})"
        )));
    }
    Ok(())
}
