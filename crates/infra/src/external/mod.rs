//! Boundary to the external accounting agent.

mod connector;

pub use connector::{
    ExternalConnector, ExternalSyncError, TimedConnector, VoucherResponse, call_with_timeout,
};
