use crate::core::currency::{BASE_CURRENCY, Currency, default_fallbacks};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_rate_refresh_secs")]
    pub rate_refresh_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_rate_refresh_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    15
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce_ms: default_debounce_ms(),
            rate_refresh_secs: default_rate_refresh_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rate_refresh(&self) -> Duration {
        Duration::from_secs(self.rate_refresh_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub currency: Currency,
    /// Units of each currency per base unit, used when no live rate exists.
    #[serde(default)]
    pub fallback_rates: HashMap<Currency, f64>,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "opsdash")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    /// Built-in fallback rates with the configured overrides applied.
    /// Overrides for the base currency, or that are not positive, are ignored.
    pub fn fallback_rates(&self) -> HashMap<Currency, f64> {
        let mut rates = default_fallbacks();
        for (currency, rate) in &self.fallback_rates {
            if *currency == BASE_CURRENCY || !rate.is_finite() || *rate <= 0.0 {
                debug!(%currency, rate, "Ignoring fallback rate override");
                continue;
            }
            rates.insert(*currency, *rate);
        }
        rates
    }
}
