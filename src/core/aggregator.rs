//! Fetches every source collection concurrently for one refresh cycle.
//!
//! A failing collection never takes its siblings down: it comes back empty and
//! is reported as a warning. Only when every collection fails does the cycle
//! count as failed.

use crate::core::filter::{DateWindow, FilterState};
use crate::core::records::{
    BookingRecord, NamedRecord, RequisitionRecord, TourBookingRecord, TransactionRecord,
    VehicleRecord, coerce_rows,
};
use crate::core::store::{Collection, RecordQuery, RecordStore, StoreError};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    pub bookings: Vec<BookingRecord>,
    pub tour_bookings: Vec<TourBookingRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub requisitions: Vec<RequisitionRecord>,
    pub vehicles: Vec<VehicleRecord>,
}

/// Reference-to-name tables for display. Not part of any calculation.
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    clients: HashMap<String, String>,
    drivers: HashMap<String, String>,
}

impl Lookups {
    pub fn new(clients: Vec<NamedRecord>, drivers: Vec<NamedRecord>) -> Self {
        let table = |records: Vec<NamedRecord>| {
            records
                .into_iter()
                .filter(|r| !r.name.is_empty())
                .map(|r| (r.id, r.name))
                .collect()
        };
        Self {
            clients: table(clients),
            drivers: table(drivers),
        }
    }

    pub fn client_name(&self, id: &str) -> Option<&str> {
        self.clients.get(id).map(String::as_str)
    }

    pub fn driver_name(&self, id: &str) -> Option<&str> {
        self.drivers.get(id).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchWarning {
    pub collection: Collection,
    pub message: String,
}

/// Everything one cycle fetched.
#[derive(Debug, Clone, Default)]
pub struct AggregatedRecords {
    /// Records inside the global filter's window.
    pub window: RecordSet,
    /// Unfiltered records, for series that carry their own period.
    pub pool: RecordSet,
    pub lookups: Lookups,
    pub warnings: Vec<FetchWarning>,
    pub(crate) attempted: usize,
    pub(crate) failed: usize,
}

impl AggregatedRecords {
    /// True when not a single calculation collection could be read.
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failed == self.attempted
    }
}

enum Problem {
    Missing,
    Failed(String),
}

struct Fetched<T> {
    collection: Collection,
    outcome: Result<Vec<T>, Problem>,
}

struct TimeFiltered {
    bookings: Fetched<BookingRecord>,
    tour_bookings: Fetched<TourBookingRecord>,
    transactions: Fetched<TransactionRecord>,
    requisitions: Fetched<RequisitionRecord>,
}

#[derive(Default)]
struct FetchReport {
    warnings: Vec<FetchWarning>,
    attempted: usize,
    failed: usize,
}

impl FetchReport {
    fn take<T>(&mut self, fetched: Fetched<T>) -> Vec<T> {
        self.attempted += 1;
        match fetched.outcome {
            Ok(records) => records,
            Err(Problem::Missing) if fetched.collection.is_optional() => {
                debug!(collection = %fetched.collection, "Optional collection not provisioned");
                Vec::new()
            }
            Err(Problem::Missing) => {
                self.failed += 1;
                self.warn(fetched.collection, "collection does not exist".to_string());
                Vec::new()
            }
            Err(Problem::Failed(message)) => {
                self.failed += 1;
                self.warn(fetched.collection, message);
                Vec::new()
            }
        }
    }

    /// Lookup failures are reported but do not count towards cycle failure.
    fn take_lookup(&mut self, fetched: Fetched<NamedRecord>) -> Vec<NamedRecord> {
        match fetched.outcome {
            Ok(records) => records,
            Err(Problem::Missing) => {
                debug!(collection = %fetched.collection, "Lookup collection not provisioned");
                Vec::new()
            }
            Err(Problem::Failed(message)) => {
                self.warn(fetched.collection, message);
                Vec::new()
            }
        }
    }

    fn warn(&mut self, collection: Collection, message: String) {
        warn!(collection = %collection, error = %message, "Collection fetch degraded to empty");
        self.warnings.push(FetchWarning {
            collection,
            message,
        });
    }
}

pub struct RecordAggregator {
    store: Arc<dyn RecordStore>,
}

impl RecordAggregator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Fetches every collection under the global filter. When a period is
    /// selected, the time-filtered collections are also fetched unfiltered so
    /// that independently filtered series have the full history.
    pub async fn fetch_all(&self, filter: &FilterState) -> AggregatedRecords {
        let window = filter.global_window();
        debug!(?window, "Fetching all collections");

        let (windowed, pool, vehicles, clients, drivers) = futures::join!(
            self.fetch_time_filtered(window),
            async {
                match window {
                    Some(_) => Some(self.fetch_time_filtered(None).await),
                    None => None,
                }
            },
            self.fetch::<VehicleRecord>(RecordQuery::all(Collection::Vehicles)),
            self.fetch::<NamedRecord>(RecordQuery::all(Collection::Clients)),
            self.fetch::<NamedRecord>(RecordQuery::all(Collection::Drivers)),
        );

        let mut report = FetchReport::default();
        let window_set = RecordSet {
            bookings: report.take(windowed.bookings),
            tour_bookings: report.take(windowed.tour_bookings),
            transactions: report.take(windowed.transactions),
            requisitions: report.take(windowed.requisitions),
            vehicles: report.take(vehicles),
        };
        let pool_set = match pool {
            Some(pool) => RecordSet {
                bookings: report.take(pool.bookings),
                tour_bookings: report.take(pool.tour_bookings),
                transactions: report.take(pool.transactions),
                requisitions: report.take(pool.requisitions),
                vehicles: window_set.vehicles.clone(),
            },
            None => window_set.clone(),
        };
        let lookups = Lookups::new(report.take_lookup(clients), report.take_lookup(drivers));

        debug!(
            bookings = window_set.bookings.len(),
            tour_bookings = window_set.tour_bookings.len(),
            transactions = window_set.transactions.len(),
            requisitions = window_set.requisitions.len(),
            vehicles = window_set.vehicles.len(),
            failed = report.failed,
            "Fetch cycle settled"
        );

        AggregatedRecords {
            window: window_set,
            pool: pool_set,
            lookups,
            warnings: report.warnings,
            attempted: report.attempted,
            failed: report.failed,
        }
    }

    async fn fetch_time_filtered(&self, window: Option<DateWindow>) -> TimeFiltered {
        let (bookings, tour_bookings, transactions, requisitions) = futures::join!(
            self.fetch::<BookingRecord>(RecordQuery::windowed(Collection::Bookings, window)),
            self.fetch::<TourBookingRecord>(RecordQuery::windowed(
                Collection::TourBookings,
                window
            )),
            self.fetch::<TransactionRecord>(RecordQuery::windowed(
                Collection::Transactions,
                window
            )),
            self.fetch::<RequisitionRecord>(RecordQuery::windowed(
                Collection::Requisitions,
                window
            )),
        );
        TimeFiltered {
            bookings,
            tour_bookings,
            transactions,
            requisitions,
        }
    }

    async fn fetch<T: DeserializeOwned + Send>(&self, query: RecordQuery) -> Fetched<T> {
        let collection = query.collection;
        let outcome = match self.store.select(&query).await {
            Ok(rows) => {
                debug!(collection = %collection, rows = rows.len(), "Fetched rows");
                Ok(coerce_rows(rows))
            }
            Err(StoreError::MissingCollection(_)) => Err(Problem::Missing),
            Err(e) => Err(Problem::Failed(e.to_string())),
        };
        Fetched {
            collection,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::Currency;
    use crate::core::filter::{FilterMode, MonthSelector};
    use crate::providers::memory::MemoryStore;
    use chrono::NaiveDate;
    use serde_json::json;

    fn filter() -> FilterState {
        FilterState::new(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(), Currency::Usd)
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_rows(
            Collection::Bookings,
            vec![
                json!({"id": "b1", "start_date": "2024-03-02", "status": "completed", "amount_paid": 10}),
                json!({"id": "b2", "start_date": "2024-02-27", "status": "completed", "amount_paid": 20}),
            ],
        );
        store.insert_rows(
            Collection::Vehicles,
            vec![json!({"id": "v1", "status": "available"})],
        );
        store.insert_rows(
            Collection::Clients,
            vec![json!({"id": "c1", "full_name": "Nguyen Van A"})],
        );
        store
    }

    #[tokio::test]
    async fn test_all_time_fetch_shares_pool() {
        let aggregator = RecordAggregator::new(Arc::new(seeded_store()));

        let records = aggregator.fetch_all(&filter()).await;

        assert_eq!(records.window.bookings.len(), 2);
        assert_eq!(records.pool.bookings.len(), 2);
        assert_eq!(records.window.vehicles.len(), 1);
        assert_eq!(records.lookups.client_name("c1"), Some("Nguyen Van A"));
        assert!(records.warnings.is_empty());
        assert!(!records.all_failed());
    }

    #[tokio::test]
    async fn test_period_filter_restricts_window_not_pool() {
        let aggregator = RecordAggregator::new(Arc::new(seeded_store()));
        let mut filter = filter();
        filter.set_mode(FilterMode::PerPeriod);
        filter.set_period(MonthSelector::Month(3), 2024).unwrap();

        let records = aggregator.fetch_all(&filter).await;

        assert_eq!(records.window.bookings.len(), 1);
        assert_eq!(records.window.bookings[0].id, "b1");
        assert_eq!(records.pool.bookings.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_collection_degrades_without_aborting_siblings() {
        let store = seeded_store();
        store.fail_collection(Collection::Bookings, "connection reset");
        let aggregator = RecordAggregator::new(Arc::new(store));

        let records = aggregator.fetch_all(&filter()).await;

        assert!(records.window.bookings.is_empty());
        assert_eq!(records.window.vehicles.len(), 1);
        assert_eq!(records.warnings.len(), 1);
        assert_eq!(records.warnings[0].collection, Collection::Bookings);
        assert!(!records.all_failed());
    }

    #[tokio::test]
    async fn test_missing_optional_collection_is_not_a_warning() {
        let store = seeded_store();
        store.drop_collection(Collection::TourBookings);
        let aggregator = RecordAggregator::new(Arc::new(store));

        let records = aggregator.fetch_all(&filter()).await;

        assert!(records.window.tour_bookings.is_empty());
        assert!(records.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_every_collection_failing_is_total_failure() {
        let store = MemoryStore::new();
        for collection in Collection::WATCHED {
            store.fail_collection(collection, "timeout");
        }
        let aggregator = RecordAggregator::new(Arc::new(store));

        let records = aggregator.fetch_all(&filter()).await;

        assert!(records.all_failed());
    }
}
