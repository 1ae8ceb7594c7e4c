//! Keeps the dashboard live.
//!
//! A single engine task owns the filter, the debounce timer and the last
//! published snapshot. Change notifications from every watched collection are
//! coalesced by [`Debouncer`]; filter changes and manual refreshes start a
//! cycle straight away. Cycles may overlap, but only the most recently started
//! one is ever published (see [`Sequencer`]).

use crate::core::aggregator::{FetchWarning, RecordAggregator};
use crate::core::config::SyncConfig;
use crate::core::currency::{Currency, CurrencyConverter};
use crate::core::filter::{FilterMode, FilterState, MonthSelector, Period, SeriesId};
use crate::core::metrics::{DashboardMetrics, calculate};
use crate::core::records::CapacityClass;
use crate::core::store::{ChangeFeed, ChangeStream, Collection, RecordStore};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, select_all};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    /// A notification arrived; a refresh starts at `deadline` unless another
    /// notification pushes it back.
    PendingRefresh { deadline: Instant },
    /// A cycle is in flight. `rerun` records a notification that arrived
    /// meanwhile.
    Refreshing { rerun: bool },
}

/// Trailing-edge debounce over change notifications. Knows nothing about
/// clocks or tasks; the engine feeds it events and acts on its answers.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: SyncState,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SyncState::PendingRefresh { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn on_change(&mut self, now: Instant) {
        self.state = match self.state {
            SyncState::Idle | SyncState::PendingRefresh { .. } => SyncState::PendingRefresh {
                deadline: now + self.window,
            },
            SyncState::Refreshing { .. } => SyncState::Refreshing { rerun: true },
        };
    }

    /// True when the pending refresh is due and should start now.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.state {
            SyncState::PendingRefresh { deadline } if now >= deadline => {
                self.state = SyncState::Refreshing { rerun: false };
                true
            }
            _ => false,
        }
    }

    /// Any cycle start, timer-driven or not. A started cycle reads everything
    /// that changed before it, so a pending timer or rerun is absorbed.
    pub fn on_refresh_started(&mut self) {
        self.state = SyncState::Refreshing { rerun: false };
    }

    /// The latest cycle finished. True when a notification arrived while it
    /// was running and exactly one more cycle is owed.
    pub fn on_refresh_finished(&mut self) -> bool {
        match self.state {
            SyncState::Refreshing { rerun: true } => true,
            SyncState::Refreshing { rerun: false } => {
                self.state = SyncState::Idle;
                false
            }
            // Notifications after completion re-armed the timer already.
            _ => false,
        }
    }
}

/// Monotonic cycle numbering with take-latest acceptance.
#[derive(Debug, Default)]
pub struct Sequencer {
    latest: u64,
}

impl Sequencer {
    pub fn begin(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Only the most recently started cycle may publish.
    pub fn accept(&self, seq: u64) -> bool {
        seq == self.latest
    }
}

/// What the display layer reads.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Last successfully computed figures. Survives a cycle in which every
    /// collection failed.
    pub metrics: Option<DashboardMetrics>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Cycle that produced this snapshot; 0 before the first publish.
    pub sequence: u64,
    /// Filter the figures were computed under.
    pub filter: FilterState,
    /// Filter of the latest published cycle. Differs from `filter` only when
    /// that cycle failed and older figures are still shown.
    pub requested: FilterState,
    pub warnings: Vec<FetchWarning>,
    pub degraded_currencies: Vec<Currency>,
}

impl Snapshot {
    fn empty(filter: FilterState) -> Self {
        Snapshot {
            metrics: None,
            loading: false,
            error: None,
            last_updated: None,
            sequence: 0,
            requested: filter.clone(),
            filter,
            warnings: Vec::new(),
            degraded_currencies: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Command {
    SetMode(FilterMode),
    SetPeriod(MonthSelector, i32),
    SetCurrency(Currency),
    SetSeries(SeriesId, Period),
    SetCapacity(Option<CapacityClass>),
    Refresh,
    Shutdown,
}

struct CycleOutcome {
    seq: u64,
    filter: FilterState,
    metrics: Option<DashboardMetrics>,
    warnings: Vec<FetchWarning>,
    degraded: Vec<Currency>,
    finished_at: DateTime<Utc>,
}

/// Fetch, convert, compute. Never fails; problems travel in the outcome.
async fn refresh_cycle(
    seq: u64,
    filter: FilterState,
    aggregator: Arc<RecordAggregator>,
    converter: Arc<CurrencyConverter>,
) -> CycleOutcome {
    let records = aggregator.fetch_all(&filter).await;
    let rates = converter.get_rates().await;
    let now = Utc::now();

    let metrics = if records.all_failed() {
        warn!(seq, "Every collection failed, keeping previous figures");
        None
    } else {
        Some(calculate(&records, &rates, &filter, now))
    };

    CycleOutcome {
        seq,
        filter,
        metrics,
        warnings: records.warnings,
        degraded: rates.degraded().to_vec(),
        finished_at: now,
    }
}

pub struct DashboardEngine {
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn ChangeFeed>,
    fallbacks: HashMap<Currency, f64>,
    sync: SyncConfig,
    filter: FilterState,
}

impl DashboardEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        feed: Arc<dyn ChangeFeed>,
        fallbacks: HashMap<Currency, f64>,
        sync: SyncConfig,
        filter: FilterState,
    ) -> Self {
        Self {
            store,
            feed,
            fallbacks,
            sync,
            filter,
        }
    }

    /// Subscribes to every watched collection, spawns the engine task and
    /// kicks off the first cycle.
    pub async fn start(self) -> Result<DashboardHandle> {
        let mut streams = Vec::with_capacity(Collection::WATCHED.len());
        for collection in Collection::WATCHED {
            let stream = self
                .feed
                .subscribe(collection)
                .await
                .with_context(|| format!("Failed to subscribe to changes on {collection}"))?;
            streams.push(stream);
        }

        let (publisher, updates) = watch::channel(Arc::new(Snapshot::empty(self.filter.clone())));
        let (commands, inbox) = mpsc::unbounded_channel();

        let task = EngineTask {
            aggregator: Arc::new(RecordAggregator::new(Arc::clone(&self.store))),
            converter: Arc::new(CurrencyConverter::new(self.store, self.fallbacks)),
            filter: self.filter,
            debouncer: Debouncer::new(self.sync.debounce()),
            sequencer: Sequencer::default(),
            publisher,
            in_flight: FuturesUnordered::new(),
        };
        let rate_refresh = self.sync.rate_refresh();
        let task = tokio::spawn(task.run(streams, inbox, rate_refresh));
        info!(collections = Collection::WATCHED.len(), "Dashboard engine started");

        Ok(DashboardHandle {
            commands,
            updates,
            task,
        })
    }
}

struct EngineTask {
    aggregator: Arc<RecordAggregator>,
    converter: Arc<CurrencyConverter>,
    filter: FilterState,
    debouncer: Debouncer,
    sequencer: Sequencer,
    publisher: watch::Sender<Arc<Snapshot>>,
    in_flight: FuturesUnordered<BoxFuture<'static, CycleOutcome>>,
}

impl EngineTask {
    async fn run(
        mut self,
        streams: Vec<ChangeStream>,
        mut inbox: mpsc::UnboundedReceiver<Command>,
        rate_refresh: Duration,
    ) {
        let mut changes = select_all(streams);
        let mut changes_open = true;
        let mut rate_timer = tokio::time::interval_at(Instant::now() + rate_refresh, rate_refresh);
        rate_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.start_refresh("initial load");

        loop {
            let deadline = self.debouncer.deadline();
            tokio::select! {
                event = changes.next(), if changes_open => match event {
                    Some(event) => {
                        debug!(collection = %event.collection, kind = ?event.kind, "Change notification");
                        self.debouncer.on_change(Instant::now());
                    }
                    None => {
                        warn!("All change streams ended, live updates stopped");
                        changes_open = false;
                    }
                },
                command = inbox.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Refresh) => self.start_refresh("manual"),
                    Some(command) => {
                        self.apply(command);
                        self.start_refresh("filter changed");
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.debouncer.on_deadline(Instant::now()) {
                        self.start_refresh("debounced changes");
                    }
                },
                _ = rate_timer.tick() => {
                    debug!("Scheduled exchange rate refresh");
                    self.debouncer.on_change(Instant::now());
                },
                Some(outcome) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.finish(outcome);
                },
            }
        }

        drop(changes);
        info!(
            discarded_cycles = self.in_flight.len(),
            "Dashboard engine stopped"
        );
    }

    fn apply(&mut self, command: Command) {
        debug!(?command, "Applying filter change");
        match command {
            Command::SetMode(mode) => self.filter.set_mode(mode),
            Command::SetPeriod(month, year) => {
                if let Err(e) = self.filter.set_period(month, year) {
                    warn!(error = %e, "Ignoring invalid period");
                }
            }
            Command::SetCurrency(currency) => self.filter.set_display_currency(currency),
            Command::SetSeries(id, period) => self.filter.set_series_filter(id, period),
            Command::SetCapacity(capacity) => self.filter.set_vehicle_capacity_filter(capacity),
            Command::Refresh | Command::Shutdown => {}
        }
    }

    fn start_refresh(&mut self, reason: &str) {
        let seq = self.sequencer.begin();
        self.debouncer.on_refresh_started();
        info!(seq, reason, "Refresh cycle started");

        self.publisher.send_modify(|snapshot| {
            Arc::make_mut(snapshot).loading = true;
        });
        self.in_flight.push(
            refresh_cycle(
                seq,
                self.filter.clone(),
                Arc::clone(&self.aggregator),
                Arc::clone(&self.converter),
            )
            .boxed(),
        );
    }

    fn finish(&mut self, outcome: CycleOutcome) {
        if !self.sequencer.accept(outcome.seq) {
            debug!(
                seq = outcome.seq,
                latest = self.sequencer.latest(),
                "Discarding superseded cycle"
            );
            return;
        }

        let failed = outcome.metrics.is_none();
        self.publisher.send_modify(|snapshot| {
            let snapshot = Arc::make_mut(snapshot);
            snapshot.sequence = outcome.seq;
            snapshot.requested = outcome.filter.clone();
            snapshot.warnings = outcome.warnings;
            snapshot.degraded_currencies = outcome.degraded;
            snapshot.loading = false;
            match outcome.metrics {
                Some(metrics) => {
                    snapshot.metrics = Some(metrics);
                    snapshot.filter = outcome.filter;
                    snapshot.error = None;
                    snapshot.last_updated = Some(outcome.finished_at);
                }
                None => {
                    snapshot.error =
                        Some("Could not load any records; showing the last known figures".into());
                }
            }
        });
        info!(seq = outcome.seq, failed, "Refresh cycle published");

        if self.debouncer.on_refresh_finished() {
            self.start_refresh("changes during refresh");
        }
    }
}

/// Control surface for a running engine. Every filter change triggers a
/// refresh. Dropping the handle stops the engine without waiting for it.
pub struct DashboardHandle {
    commands: mpsc::UnboundedSender<Command>,
    updates: watch::Receiver<Arc<Snapshot>>,
    task: JoinHandle<()>,
}

impl DashboardHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Dashboard engine is not running"))
    }

    pub fn set_filter_mode(&self, mode: FilterMode) -> Result<()> {
        self.send(Command::SetMode(mode))
    }

    /// `MonthSelector::All` selects the whole year.
    pub fn set_filter_period(&self, month: MonthSelector, year: i32) -> Result<()> {
        if let MonthSelector::Month(index) = month {
            Period::month(year, index)?;
        }
        self.send(Command::SetPeriod(month, year))
    }

    pub fn set_display_currency(&self, currency: Currency) -> Result<()> {
        self.send(Command::SetCurrency(currency))
    }

    /// Changes one series' period; the KPIs and other series keep theirs.
    pub fn set_series_filter(&self, id: SeriesId, period: Period) -> Result<()> {
        if let Period::Month { year, month } = period {
            Period::month(year, month)?;
        }
        self.send(Command::SetSeries(id, period))
    }

    pub fn set_vehicle_capacity_filter(&self, capacity: Option<CapacityClass>) -> Result<()> {
        self.send(Command::SetCapacity(capacity))
    }

    pub fn refresh_now(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.updates.borrow())
    }

    /// A receiver that wakes on every publish.
    pub fn updates(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.updates.clone()
    }

    /// Stops the engine and waits until every subscription and timer is gone.
    pub async fn shutdown(self) -> Result<()> {
        // Already stopped is fine; the join below still reports a panic.
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.context("Dashboard engine task failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::default_fallbacks;
    use crate::core::store::ChangeKind;
    use crate::providers::memory::MemoryStore;
    use chrono::{Datelike, NaiveDate};
    use serde_json::json;

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_debouncer_coalesces_and_rearms() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.on_change(start);
        debouncer.on_change(start + Duration::from_millis(300));

        assert_eq!(debouncer.deadline(), Some(start + Duration::from_millis(800)));
        assert!(!debouncer.on_deadline(start + Duration::from_millis(500)));
        assert!(debouncer.on_deadline(start + Duration::from_millis(800)));
        assert_eq!(debouncer.state(), SyncState::Refreshing { rerun: false });
        assert!(!debouncer.on_refresh_finished());
        assert_eq!(debouncer.state(), SyncState::Idle);
    }

    #[test]
    fn test_debouncer_owes_exactly_one_rerun() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.on_refresh_started();

        debouncer.on_change(now);
        debouncer.on_change(now);
        debouncer.on_change(now);

        assert_eq!(debouncer.state(), SyncState::Refreshing { rerun: true });
        assert!(debouncer.on_refresh_finished());
        debouncer.on_refresh_started();
        assert!(!debouncer.on_refresh_finished());
    }

    #[test]
    fn test_manual_refresh_absorbs_pending_timer() {
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.on_change(Instant::now());

        debouncer.on_refresh_started();

        assert_eq!(debouncer.deadline(), None);
    }

    #[test]
    fn test_sequencer_accepts_only_latest() {
        let mut sequencer = Sequencer::default();
        let first = sequencer.begin();
        let second = sequencer.begin();

        assert!(second > first);
        assert!(!sequencer.accept(first));
        assert!(sequencer.accept(second));
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_rows(
            Collection::Bookings,
            vec![
                json!({"id": "b1", "start_date": "2023-06-01", "status": "completed", "amount_paid": 300}),
                json!({"id": "b2", "start_date": "2024-03-02", "status": "completed", "amount_paid": 100}),
            ],
        );
        store.insert_rows(
            Collection::Vehicles,
            vec![json!({"id": "v1", "status": "available", "seats": 7})],
        );
        store
    }

    async fn start(store: &Arc<MemoryStore>) -> DashboardHandle {
        start_with(store, SyncConfig::default()).await
    }

    async fn start_with(store: &Arc<MemoryStore>, sync: SyncConfig) -> DashboardHandle {
        let filter = FilterState::new(
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            Currency::Usd,
        );
        DashboardEngine::new(
            store.clone(),
            store.clone(),
            default_fallbacks(),
            sync,
            filter,
        )
        .start()
        .await
        .unwrap()
    }

    async fn settled(handle: &DashboardHandle, sequence: u64) -> Arc<Snapshot> {
        let mut updates = handle.updates();
        let snapshot = updates
            .wait_for(|s| s.sequence == sequence && !s.loading)
            .await
            .unwrap();
        Arc::clone(&snapshot)
    }

    fn total_revenue(snapshot: &Snapshot) -> f64 {
        snapshot.metrics.as_ref().unwrap().kpis.total_revenue
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_publishes_metrics() {
        let store = seeded_store();
        let handle = start(&store).await;

        let snapshot = settled(&handle, 1).await;

        assert_eq!(total_revenue(&snapshot), 400.0);
        assert!(snapshot.error.is_none());
        assert!(snapshot.last_updated.is_some());
        assert_eq!(snapshot.degraded_currencies.len(), 2);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_notifications_triggers_one_cycle() {
        let store = seeded_store();
        let handle = start(&store).await;
        settled(&handle, 1).await;
        let selects_per_cycle = store.select_count();

        let burst_started = Instant::now();
        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            store.notify(Collection::Bookings, kind);
            store.notify(Collection::Requisitions, kind);
        }
        let snapshot = settled(&handle, 2).await;

        assert!(burst_started.elapsed() >= WINDOW);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.snapshot().sequence, 2);
        assert_eq!(store.select_count(), 2 * selects_per_cycle);
        assert_eq!(total_revenue(&snapshot), 400.0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_during_refresh_causes_one_rerun() {
        let store = seeded_store();
        store.set_delay(|_| Duration::from_millis(200));
        let handle = start(&store).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.snapshot().loading);
        store.notify(Collection::Vehicles, ChangeKind::Update);
        store.notify(Collection::Vehicles, ChangeKind::Update);

        settled(&handle, 2).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(handle.snapshot().sequence, 2);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_cycle_is_never_published() {
        let store = seeded_store();
        store.set_delay(|query| match &query.time_range {
            Some(range) if range.window.start.year() == 2023 => Duration::from_millis(800),
            _ => Duration::from_millis(10),
        });
        let handle = start(&store).await;
        settled(&handle, 1).await;
        let mut updates = handle.updates();
        updates.borrow_and_update();

        handle.set_filter_mode(FilterMode::PerPeriod).unwrap();
        handle.set_filter_period(MonthSelector::All, 2023).unwrap();
        handle.set_filter_period(MonthSelector::All, 2024).unwrap();

        let mut published = Vec::new();
        while published.last() != Some(&4) {
            updates.changed().await.unwrap();
            let snapshot = updates.borrow_and_update().clone();
            if !snapshot.loading {
                published.push(snapshot.sequence);
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let snapshot = handle.snapshot();
        assert_eq!(published, vec![4]);
        assert_eq!(snapshot.sequence, 4);
        assert_eq!(snapshot.filter.year, 2024);
        assert_eq!(total_revenue(&snapshot), 100.0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_changes_each_refresh() {
        let store = seeded_store();
        let handle = start(&store).await;
        settled(&handle, 1).await;

        handle.set_display_currency(Currency::Vnd).unwrap();
        let snapshot = settled(&handle, 2).await;
        assert_eq!(snapshot.metrics.as_ref().unwrap().kpis.currency, Currency::Vnd);
        assert_eq!(total_revenue(&snapshot), 400.0 * 25_000.0);

        handle
            .set_series_filter(SeriesId::TopVehicles, Period::Year(2023))
            .unwrap();
        let snapshot = settled(&handle, 3).await;
        assert_eq!(snapshot.filter.series.top_vehicles, Period::Year(2023));
        assert_eq!(snapshot.filter.mode, FilterMode::AllTime);

        handle
            .set_vehicle_capacity_filter(Some(CapacityClass::SevenSeat))
            .unwrap();
        handle.refresh_now().unwrap();
        let snapshot = settled(&handle, 5).await;
        assert_eq!(
            snapshot.filter.series.top_vehicle_capacity,
            Some(CapacityClass::SevenSeat)
        );

        assert!(handle.set_filter_period(MonthSelector::Month(13), 2024).is_err());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_series_month_is_rejected() {
        let store = seeded_store();
        let handle = start(&store).await;
        settled(&handle, 1).await;

        for month in [0, 13] {
            let period = Period::Month { year: 2024, month };
            assert!(handle.set_series_filter(SeriesId::MonthlyTrend, period).is_err());
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.filter.series.monthly_trend, Period::Year(2024));
        handle.shutdown().await.unwrap();
    }

    fn hourly() -> SyncConfig {
        SyncConfig {
            rate_refresh_secs: 3600,
            ..SyncConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_timer_runs_one_refresh_per_tick() {
        let store = seeded_store();
        let handle = start_with(&store, hourly()).await;
        let snapshot = settled(&handle, 1).await;
        assert_eq!(snapshot.degraded_currencies.len(), 2);
        let selects_per_cycle = store.select_count();
        store.insert_rows(
            Collection::ExchangeRates,
            vec![json!({"source_currency": "USD", "target_currency": "VND", "rate": 24000.0, "timestamp": "2024-03-01T00:00:00Z"})],
        );

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert_eq!(handle.snapshot().sequence, 1);

        let snapshot = settled(&handle, 2).await;
        assert_eq!(snapshot.degraded_currencies, vec![Currency::Eur]);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(handle.snapshot().sequence, 2);
        assert_eq!(store.select_count(), 2 * selects_per_cycle);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_change_coalesces_with_timer_tick() {
        let store = seeded_store();
        let handle = start_with(&store, hourly()).await;
        settled(&handle, 1).await;
        let selects_per_cycle = store.select_count();

        tokio::time::sleep(Duration::from_millis(3_599_800)).await;
        store.notify(Collection::ExchangeRates, ChangeKind::Update);

        settled(&handle, 2).await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(handle.snapshot().sequence, 2);
        assert_eq!(store.select_count(), 2 * selects_per_cycle);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_keeps_last_good_figures() {
        let store = seeded_store();
        let handle = start(&store).await;
        settled(&handle, 1).await;

        for collection in Collection::WATCHED {
            store.fail_collection(collection, "network unreachable");
        }
        handle.refresh_now().unwrap();
        let snapshot = settled(&handle, 2).await;

        assert!(snapshot.error.is_some());
        assert_eq!(total_revenue(&snapshot), 400.0);
        assert!(!snapshot.warnings.is_empty());

        handle.set_display_currency(Currency::Vnd).unwrap();
        let snapshot = settled(&handle, 3).await;
        assert_eq!(snapshot.filter.display_currency, Currency::Usd);
        assert_eq!(snapshot.requested.display_currency, Currency::Vnd);
        assert_eq!(
            snapshot.metrics.as_ref().unwrap().kpis.currency,
            Currency::Usd
        );

        for collection in Collection::WATCHED {
            store.heal_collection(collection);
        }
        handle.refresh_now().unwrap();
        let snapshot = settled(&handle, 4).await;
        assert!(snapshot.error.is_none());
        assert!(snapshot.warnings.is_empty());
        assert_eq!(snapshot.filter, snapshot.requested);
        assert_eq!(snapshot.filter.display_currency, Currency::Vnd);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_subscriptions() {
        let store = seeded_store();
        let handle = start(&store).await;
        assert_eq!(store.subscriber_count(), Collection::WATCHED.len());
        settled(&handle, 1).await;

        handle.shutdown().await.unwrap();
        let selects = store.select_count();
        store.notify(Collection::Bookings, ChangeKind::Insert);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(store.select_count(), selects);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_close_after_shutdown() {
        let store = seeded_store();
        let handle = start(&store).await;
        let updates = handle.updates();

        handle.shutdown().await.unwrap();

        assert!(updates.has_changed().is_err());
        assert_eq!(store.subscriber_count(), 0);
    }
}
