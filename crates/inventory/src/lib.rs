//! Inventory domain module.
//!
//! Business rules for products, stock movements and the remaining-stock
//! projection, implemented purely as deterministic domain logic (no IO, no
//! locking, no storage).

pub mod movement;
pub mod product;
pub mod remaining;

pub use movement::{
    Movement, MovementDetails, MovementKind, MovementPatch, NewMovement, StockInDetails,
    StockOutDetails, net_stock,
};
pub use product::{NewProduct, Product};
pub use remaining::{RemainingStock, recency_order, remaining_after};
