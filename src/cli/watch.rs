use super::{summary, ui};
use crate::core::config::SyncConfig;
use crate::core::currency::Currency;
use crate::core::filter::FilterState;
use crate::core::store::{ChangeFeed, RecordStore};
use crate::core::sync::{DashboardEngine, Snapshot};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Full dashboard text for one published snapshot.
pub fn render_snapshot(snapshot: &Snapshot) -> String {
    let mut output = match &snapshot.metrics {
        Some(metrics) => metrics.display_as_table(&snapshot.filter),
        None => ui::style_text("No figures loaded yet\n", ui::StyleType::Subtle),
    };
    if let Some(error) = &snapshot.error {
        output.push_str(&ui::style_text(&format!("{error}\n"), ui::StyleType::Error));
    }
    if snapshot.metrics.is_some() && snapshot.requested != snapshot.filter {
        output.push_str(&ui::style_text(
            &format!(
                "Requested {} ({}) is not loaded yet\n",
                snapshot.requested.global_period(),
                snapshot.requested.display_currency
            ),
            ui::StyleType::Error,
        ));
    }
    output.push_str(&summary::degradation_report(
        &snapshot.warnings,
        &snapshot.degraded_currencies,
    ));
    let updated = snapshot
        .last_updated
        .map_or("never".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    output.push_str(&ui::style_text(
        &format!("Cycle {} · last updated {updated}\n", snapshot.sequence),
        ui::StyleType::Subtle,
    ));
    output
}

/// Runs the live engine and re-renders on every publish until Ctrl-C.
pub async fn run(
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn ChangeFeed>,
    fallbacks: HashMap<Currency, f64>,
    sync: SyncConfig,
    filter: FilterState,
) -> Result<()> {
    let handle = DashboardEngine::new(store, feed, fallbacks, sync, filter)
        .start()
        .await?;
    let mut updates = handle.updates();
    let pb = ui::new_spinner("Loading dashboard...");
    let mut rendered = 0usize;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = Arc::clone(&updates.borrow_and_update());
                if snapshot.loading {
                    continue;
                }
                if rendered == 0 {
                    pb.finish_and_clear();
                } else {
                    ui::print_separator();
                }
                println!("{}", render_snapshot(&snapshot));
                rendered += 1;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping dashboard");
                break;
            }
        }
    }

    pb.finish_and_clear();
    handle.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aggregator::AggregatedRecords;
    use crate::core::currency::{RateTable, default_fallbacks};
    use crate::core::filter::{FilterMode, MonthSelector};
    use crate::core::metrics::calculate;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn test_render_before_first_cycle() {
        let filter =
            FilterState::new(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(), Currency::Usd);
        let snapshot = Snapshot {
            metrics: None,
            loading: false,
            error: Some("Could not load any records".to_string()),
            last_updated: None,
            sequence: 1,
            requested: filter.clone(),
            filter,
            warnings: Vec::new(),
            degraded_currencies: vec![Currency::Eur],
        };

        let output = render_snapshot(&snapshot);

        assert!(output.contains("No figures loaded yet"));
        assert!(output.contains("Could not load any records"));
        assert!(output.contains("EUR"));
        assert!(output.contains("last updated never"));
        assert!(!output.contains("Requested"));
    }

    #[test]
    fn test_failed_cycle_keeps_labels_of_shown_figures() {
        let filter =
            FilterState::new(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(), Currency::Usd);
        let metrics = calculate(
            &AggregatedRecords::default(),
            &RateTable::fallback(&default_fallbacks()),
            &filter,
            Utc::now(),
        );
        let mut requested = filter.clone();
        requested.set_mode(FilterMode::PerPeriod);
        requested.set_period(MonthSelector::Month(2), 2023).unwrap();
        requested.set_display_currency(Currency::Vnd);
        let snapshot = Snapshot {
            metrics: Some(metrics),
            loading: false,
            error: Some("Could not load any records".to_string()),
            last_updated: Some(Utc::now()),
            sequence: 2,
            filter,
            requested,
            warnings: Vec::new(),
            degraded_currencies: Vec::new(),
        };

        let output = render_snapshot(&snapshot);

        assert!(output.contains("All time"));
        assert!(output.contains("(USD)"));
        assert!(output.contains("Requested 2023-02 (VND) is not loaded yet"));
    }
}
