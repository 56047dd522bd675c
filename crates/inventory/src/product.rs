use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ProductId};

/// Catalog definition of a product: everything except the stock counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub id: ProductId,
    pub name: String,
    /// Unit of measure (e.g. "kg", "pcs").
    pub unit: String,
    /// Low-stock alert threshold.
    pub min_stock: i64,
}

impl NewProduct {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if self.unit.trim().is_empty() {
            return Err(DomainError::validation("unit cannot be empty"));
        }
        if self.min_stock < 0 {
            return Err(DomainError::validation("min_stock cannot be negative"));
        }
        Ok(())
    }

    /// Pair the definition with a stock value read from the aggregate.
    pub fn with_stock(&self, current_stock: i64) -> Product {
        Product {
            id: self.id,
            name: self.name.clone(),
            unit: self.unit.clone(),
            min_stock: self.min_stock,
            current_stock,
        }
    }
}

/// Read-only product snapshot.
///
/// `current_stock` has no setter: the counter itself lives in the aggregate
/// service, and this type only reports what it was at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    unit: String,
    min_stock: i64,
    current_stock: i64,
}

impl Product {
    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn min_stock(&self) -> i64 {
        self.min_stock
    }

    pub fn current_stock(&self) -> i64 {
        self.current_stock
    }

    /// At or below the alert threshold.
    pub fn is_low_stock(&self) -> bool {
        self.current_stock <= self.min_stock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flour() -> NewProduct {
        NewProduct {
            id: ProductId::new(),
            name: "Flour".to_string(),
            unit: "kg".to_string(),
            min_stock: 10,
        }
    }

    #[test]
    fn valid_definition_passes() {
        assert!(flour().validate().is_ok());
    }

    #[test]
    fn blank_name_unit_and_negative_threshold_are_rejected() {
        let mut p = flour();
        p.name = "  ".to_string();
        assert!(matches!(p.validate(), Err(DomainError::Validation(_))));

        let mut p = flour();
        p.unit = String::new();
        assert!(matches!(p.validate(), Err(DomainError::Validation(_))));

        let mut p = flour();
        p.min_stock = -1;
        assert!(matches!(p.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn low_stock_is_inclusive_of_threshold() {
        assert!(flour().with_stock(10).is_low_stock());
        assert!(flour().with_stock(3).is_low_stock());
        assert!(!flour().with_stock(11).is_low_stock());
    }
}
