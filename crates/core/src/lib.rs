//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the error taxonomy, typed identifiers, optimistic-concurrency versions and the
//! fixed-offset business calendar.

pub mod error;
pub mod id;
pub mod time;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, MovementId, ProductId};
pub use time::{BusinessCalendar, parse_utc_instant};
pub use version::ExpectedVersion;
