//! Append-mostly ledger storage boundary.
//!
//! One stream per product. Rows are appended, edited in place, or soft-deleted;
//! every write bumps the stream version so callers can detect foreign writers
//! through `ExpectedVersion`.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use r#trait::{LedgerStore, LedgerStoreError, ProductStream, StoreWrite};
