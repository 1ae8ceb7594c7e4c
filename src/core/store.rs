//! Abstractions over the external record store: a read-only query capability
//! and a per-collection change-notification capability.

use crate::core::filter::DateWindow;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Collection {
    Bookings,
    Vehicles,
    Transactions,
    Requisitions,
    TourBookings,
    ExchangeRates,
    Clients,
    Drivers,
}

impl Collection {
    /// Collections whose changes should trigger a recomputation.
    pub const WATCHED: [Collection; 6] = [
        Collection::Bookings,
        Collection::Vehicles,
        Collection::Requisitions,
        Collection::Transactions,
        Collection::TourBookings,
        Collection::ExchangeRates,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Collection::Bookings => "bookings",
            Collection::Vehicles => "vehicles",
            Collection::Transactions => "transactions",
            Collection::Requisitions => "cost_requisitions",
            Collection::TourBookings => "tour_bookings",
            Collection::ExchangeRates => "exchange_rates",
            Collection::Clients => "clients",
            Collection::Drivers => "drivers",
        }
    }

    /// The field a calendar window is applied to, if the collection is
    /// time-filtered at all.
    pub fn date_field(&self) -> Option<&'static str> {
        match self {
            Collection::Bookings | Collection::TourBookings => Some("start_date"),
            Collection::Transactions => Some("date"),
            Collection::Requisitions => Some("created_at"),
            _ => None,
        }
    }

    /// Optional collections may not be provisioned in every store; their
    /// absence is an empty result, not a failure.
    pub fn is_optional(&self) -> bool {
        matches!(self, Collection::TourBookings)
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeRange {
    pub field: &'static str,
    pub window: DateWindow,
}

/// "select * from collection [where field within window] [and k = v ...]"
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub collection: Collection,
    pub time_range: Option<TimeRange>,
    pub equals: Vec<(String, String)>,
}

impl RecordQuery {
    pub fn all(collection: Collection) -> Self {
        Self {
            collection,
            time_range: None,
            equals: Vec::new(),
        }
    }

    /// Restricts the query to `window` on the collection's canonical date
    /// field. `None` (all time), or a collection without a date field, leaves
    /// the query unfiltered.
    pub fn windowed(collection: Collection, window: Option<DateWindow>) -> Self {
        let time_range = match (collection.date_field(), window) {
            (Some(field), Some(window)) => Some(TimeRange { field, window }),
            _ => None,
        };
        Self {
            collection,
            time_range,
            equals: Vec::new(),
        }
    }

    pub fn with_equals(mut self, field: &str, value: &str) -> Self {
        self.equals.push((field.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Collection does not exist: {0}")]
    MissingCollection(Collection),

    #[error("HTTP error: {status} for collection: {collection}")]
    Http {
        collection: Collection,
        status: u16,
    },

    #[error("Request error for collection {collection}: {message}")]
    Transport {
        collection: Collection,
        message: String,
    },

    #[error("Failed to decode rows for collection {collection}: {message}")]
    Decode {
        collection: Collection,
        message: String,
    },
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select(&self, query: &RecordQuery) -> Result<Vec<Value>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: ChangeKind,
}

/// Dropping the stream ends the subscription.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, collection: Collection) -> anyhow::Result<ChangeStream>;
}
