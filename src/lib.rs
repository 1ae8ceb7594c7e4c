pub mod cli;
pub mod core;
pub mod providers;

use crate::core::config::AppConfig;
use crate::core::currency::Currency;
use crate::core::filter::{FilterMode, FilterState, MonthSelector};
use crate::providers::{PollingChangeFeed, RestStore};
use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Global filter selection from the command line. Giving a month or a year
/// switches from all-time to that period.
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    /// 1-based.
    pub month: Option<u32>,
    pub year: Option<i32>,
    pub currency: Option<Currency>,
}

impl ViewOptions {
    pub fn filter(&self, today: NaiveDate, default_currency: Currency) -> Result<FilterState> {
        let mut filter = FilterState::new(today, self.currency.unwrap_or(default_currency));
        if self.month.is_none() && self.year.is_none() {
            return Ok(filter);
        }

        let month = self.month.map_or(MonthSelector::All, MonthSelector::Month);
        filter.set_mode(FilterMode::PerPeriod);
        filter.set_period(month, self.year.unwrap_or(today.year()))?;
        Ok(filter)
    }
}

pub enum AppCommand {
    Summary(ViewOptions),
    Watch(ViewOptions),
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("Operations dashboard starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let store = Arc::new(RestStore::new(&config.store)?);
    let today = Utc::now().date_naive();

    match command {
        AppCommand::Summary(options) => {
            let filter = options.filter(today, config.currency)?;
            cli::summary::run(store, config.fallback_rates(), &filter).await
        }
        AppCommand::Watch(options) => {
            let filter = options.filter(today, config.currency)?;
            let feed = Arc::new(PollingChangeFeed::new(
                store.clone(),
                config.sync.poll_interval(),
            ));
            cli::watch::run(store, feed, config.fallback_rates(), config.sync.clone(), filter).await
        }
    }
}
