//! Infrastructure layer: ledger storage, the aggregate write path, history
//! queries, the sync queue and the external connector boundary.

pub mod aggregate_service;
pub mod config;
pub mod consistency;
pub mod external;
pub mod history;
pub mod ledger_store;
pub mod sync;


pub use aggregate_service::{AggregateService, LedgerError, LedgerResult};
pub use config::{ConfigError, EngineConfig};
pub use consistency::{
    ConsistencyReport, ConsistencySweeper, ConsistencyViolation, RecomputeOutcome, SweeperHandle,
};
