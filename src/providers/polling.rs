use crate::core::store::{
    ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, Collection, RecordQuery, RecordStore,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Change feed for stores without push notifications: each subscription
/// re-reads its collection on a fixed interval and emits an `Any` event
/// whenever the content differs from the previous read.
pub struct PollingChangeFeed {
    store: Arc<dyn RecordStore>,
    interval: Duration,
}

impl PollingChangeFeed {
    pub fn new(store: Arc<dyn RecordStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

/// Order-sensitive digest of the rows.
fn fingerprint(rows: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    rows.len().hash(&mut hasher);
    for row in rows {
        row.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

struct Poller {
    store: Arc<dyn RecordStore>,
    collection: Collection,
    interval: Duration,
    last: Option<u64>,
}

impl Poller {
    async fn read(&self) -> Option<u64> {
        match self.store.select(&RecordQuery::all(self.collection)).await {
            Ok(rows) => Some(fingerprint(&rows)),
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Change poll failed");
                None
            }
        }
    }

    async fn next_change(mut self) -> Option<(ChangeEvent, Self)> {
        loop {
            tokio::time::sleep(self.interval).await;
            let Some(current) = self.read().await else {
                continue;
            };
            let previous = self.last.replace(current);
            if previous.is_some_and(|previous| previous != current) {
                debug!(collection = %self.collection, "Polled collection changed");
                let event = ChangeEvent {
                    collection: self.collection,
                    kind: ChangeKind::Any,
                };
                return Some((event, self));
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for PollingChangeFeed {
    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream> {
        let mut poller = Poller {
            store: Arc::clone(&self.store),
            collection,
            interval: self.interval,
            last: None,
        };
        poller.last = poller.read().await;
        debug!(collection = %collection, interval = ?self.interval, "Polling for changes");

        Ok(futures::stream::unfold(poller, Poller::next_change).boxed())
    }
}
