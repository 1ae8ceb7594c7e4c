use crate::core::records::lenient::parse_date;
use crate::core::store::{
    ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, Collection, RecordQuery, RecordStore,
    StoreError,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

type DelayFn = Arc<dyn Fn(&RecordQuery) -> Duration + Send + Sync>;

#[derive(Default)]
struct Inner {
    rows: HashMap<Collection, Vec<Value>>,
    failing: HashMap<Collection, String>,
    dropped: HashSet<Collection>,
    subscribers: HashMap<Collection, Vec<UnboundedSender<ChangeEvent>>>,
    delay: Option<DelayFn>,
}

/// In-process record store and change feed.
///
/// Queries are answered from rows held in memory, with the same time-window
/// and equality semantics as the REST store. Collections can be made to fail
/// or disappear, and changes are pushed to subscribers with [`notify`].
///
/// [`notify`]: MemoryStore::notify
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    selects: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_rows(&self, collection: Collection, rows: Vec<Value>) {
        let mut inner = self.lock();
        inner.dropped.remove(&collection);
        inner.rows.entry(collection).or_default().extend(rows);
    }

    /// Replaces the collection's content without notifying anyone.
    pub fn replace_rows(&self, collection: Collection, rows: Vec<Value>) {
        let mut inner = self.lock();
        inner.dropped.remove(&collection);
        inner.rows.insert(collection, rows);
    }

    /// Every query against `collection` fails with a transport error until
    /// [`MemoryStore::heal_collection`] is called.
    pub fn fail_collection(&self, collection: Collection, message: &str) {
        self.lock().failing.insert(collection, message.to_string());
    }

    pub fn heal_collection(&self, collection: Collection) {
        self.lock().failing.remove(&collection);
    }

    /// Makes the collection behave as if it was never provisioned.
    pub fn drop_collection(&self, collection: Collection) {
        let mut inner = self.lock();
        inner.rows.remove(&collection);
        inner.dropped.insert(collection);
    }

    /// Simulated latency, decided per query.
    pub fn set_delay<F>(&self, delay: F)
    where
        F: Fn(&RecordQuery) -> Duration + Send + Sync + 'static,
    {
        self.lock().delay = Some(Arc::new(delay));
    }

    /// Pushes a change event to every live subscriber of `collection`.
    pub fn notify(&self, collection: Collection, kind: ChangeKind) {
        let mut inner = self.lock();
        if let Some(senders) = inner.subscribers.get_mut(&collection) {
            senders.retain(|tx| tx.unbounded_send(ChangeEvent { collection, kind }).is_ok());
        }
    }

    /// Live subscriptions across all collections. Dropped streams are not
    /// counted.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner
            .subscribers
            .values_mut()
            .map(|senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
            .sum()
    }

    /// Number of queries answered (or failed) so far.
    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }
}

fn field_text(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn row_matches(row: &Value, query: &RecordQuery) -> bool {
    if let Some(range) = &query.time_range {
        let in_window = field_text(row, range.field)
            .and_then(|s| parse_date(&s))
            .is_some_and(|date| range.window.contains(date));
        if !in_window {
            return false;
        }
    }
    query
        .equals
        .iter()
        .all(|(field, value)| field_text(row, field).as_deref() == Some(value.as_str()))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn select(&self, query: &RecordQuery) -> Result<Vec<Value>, StoreError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        let collection = query.collection;
        let (outcome, delay) = {
            let inner = self.lock();
            let outcome = if inner.dropped.contains(&collection) {
                Err(StoreError::MissingCollection(collection))
            } else if let Some(message) = inner.failing.get(&collection) {
                Err(StoreError::Transport {
                    collection,
                    message: message.clone(),
                })
            } else {
                Ok(inner
                    .rows
                    .get(&collection)
                    .map(|rows| rows.iter().filter(|row| row_matches(row, query)).cloned().collect())
                    .unwrap_or_default())
            };
            (outcome, inner.delay.as_ref().map(|delay| delay(query)))
        };

        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        debug!(collection = %collection, ok = outcome.is_ok(), "In-memory select");
        outcome
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream> {
        let (tx, rx) = unbounded();
        self.lock().subscribers.entry(collection).or_default().push(tx);
        debug!(collection = %collection, "Subscribed to in-memory changes");
        Ok(rx.boxed())
    }
}
