//! Metrics reconciliation engine

pub mod aggregator;
pub mod config;
pub mod currency;
pub mod filter;
pub mod log;
pub mod metrics;
pub mod records;
pub mod rules;
pub mod series;
pub mod store;
pub mod sync;

// Re-export main types for cleaner imports
pub use currency::{Currency, CurrencyConverter, RateTable};
pub use filter::{FilterMode, FilterState, MonthSelector, Period, SeriesId};
pub use metrics::DashboardMetrics;
pub use store::{ChangeFeed, Collection, RecordStore, StoreError};
pub use sync::{DashboardEngine, DashboardHandle, Snapshot};
