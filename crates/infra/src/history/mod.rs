//! Movement history: paginated queries, unpaginated export and daily totals.

mod query;
mod service;

pub use query::{
    DailyMovementSummary, MovementFilter, MovementPage, MovementView, PageRequest, Pagination,
    SortBy, SortOrder, sort_movements,
};
pub use service::HistoryService;
