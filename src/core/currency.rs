//! Currency normalization: every amount is folded into the base currency
//! before it is combined, and only leaves it again at the point of display.

use crate::core::records::ExchangeRateRecord;
use crate::core::store::{Collection, RecordQuery, RecordStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "VND")]
    Vnd,
    #[serde(rename = "EUR")]
    Eur,
}

pub const BASE_CURRENCY: Currency = Currency::Usd;

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Vnd, Currency::Eur];

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Vnd => "VND",
            Currency::Eur => "EUR",
        }
    }

    /// Units of this currency per one unit of the base currency, used whenever
    /// the rate collection has nothing usable.
    pub fn default_rate(&self) -> f64 {
        match self {
            Currency::Usd => 1.0,
            Currency::Vnd => 25_000.0,
            Currency::Eur => 0.92,
        }
    }
}

impl Default for Currency {
    fn default() -> Self {
        BASE_CURRENCY
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Currency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "USD" | "$" => Ok(Currency::Usd),
            "VND" | "₫" => Ok(Currency::Vnd),
            "EUR" | "€" => Ok(Currency::Eur),
            _ => Err(anyhow::anyhow!("Unsupported currency: {}", s)),
        }
    }
}

/// Mapping from currency to "units of that currency per one base unit".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateTable {
    rates: HashMap<Currency, f64>,
    fallbacks: HashMap<Currency, f64>,
    degraded: Vec<Currency>,
}

impl RateTable {
    /// A table made entirely of fallback rates.
    pub fn fallback(fallbacks: &HashMap<Currency, f64>) -> Self {
        let mut table = Self {
            rates: HashMap::new(),
            fallbacks: fallbacks.clone(),
            degraded: Vec::new(),
        };
        for currency in Currency::ALL {
            let rate = table.fallback_rate(currency);
            table.rates.insert(currency, rate);
            if currency != BASE_CURRENCY {
                table.degraded.push(currency);
            }
        }
        table
    }

    /// Builds a table from live rates; any supported currency missing from
    /// `live` is filled from the fallbacks and reported as degraded.
    pub fn from_live(live: HashMap<Currency, f64>, fallbacks: &HashMap<Currency, f64>) -> Self {
        let mut table = Self {
            rates: HashMap::new(),
            fallbacks: fallbacks.clone(),
            degraded: Vec::new(),
        };
        for currency in Currency::ALL {
            if currency == BASE_CURRENCY {
                table.rates.insert(currency, 1.0);
                continue;
            }
            match live.get(&currency) {
                Some(rate) if is_usable(*rate) => {
                    table.rates.insert(currency, *rate);
                }
                _ => {
                    let rate = table.fallback_rate(currency);
                    table.rates.insert(currency, rate);
                    table.degraded.push(currency);
                }
            }
        }
        table
    }

    /// The rate for `currency`; never zero, negative or non-finite.
    pub fn rate(&self, currency: Currency) -> f64 {
        match self.rates.get(&currency) {
            Some(rate) if is_usable(*rate) => *rate,
            _ => self.fallback_rate(currency),
        }
    }

    /// Currencies that are being served from fallback rates.
    pub fn degraded(&self) -> &[Currency] {
        &self.degraded
    }

    fn fallback_rate(&self, currency: Currency) -> f64 {
        if currency == BASE_CURRENCY {
            return 1.0;
        }
        match self.fallbacks.get(&currency) {
            Some(rate) if is_usable(*rate) => *rate,
            _ => currency.default_rate(),
        }
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::fallback(&default_fallbacks())
    }
}

fn is_usable(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

pub fn default_fallbacks() -> HashMap<Currency, f64> {
    Currency::ALL
        .iter()
        .map(|currency| (*currency, currency.default_rate()))
        .collect()
}

pub fn to_base(amount: f64, currency: Currency, rates: &RateTable) -> f64 {
    if currency == BASE_CURRENCY {
        return amount;
    }
    amount / rates.rate(currency)
}

pub fn from_base(amount: f64, currency: Currency, rates: &RateTable) -> f64 {
    if currency == BASE_CURRENCY {
        return amount;
    }
    amount * rates.rate(currency)
}

/// Loads the live rate table from the exchange-rate collection.
pub struct CurrencyConverter {
    store: Arc<dyn RecordStore>,
    fallbacks: HashMap<Currency, f64>,
}

impl CurrencyConverter {
    pub fn new(store: Arc<dyn RecordStore>, fallbacks: HashMap<Currency, f64>) -> Self {
        Self { store, fallbacks }
    }

    /// Fetches every rate quoted from the base currency and keeps the most
    /// recent record per target. Never fails: a failed fetch or a missing
    /// target degrades to the fallback rate.
    #[instrument(name = "RateRefresh", skip(self))]
    pub async fn get_rates(&self) -> RateTable {
        let query = RecordQuery::all(Collection::ExchangeRates)
            .with_equals("source_currency", BASE_CURRENCY.code());
        let records = match self.store.select(&query).await {
            Ok(rows) => crate::core::records::coerce_rows::<ExchangeRateRecord>(rows),
            Err(e) => {
                warn!(error = %e, "Exchange rate fetch failed, using fallback rates");
                Vec::new()
            }
        };

        let table = RateTable::from_live(latest_rates(&records), &self.fallbacks);
        for currency in table.degraded() {
            warn!(
                currency = %currency,
                rate = table.rate(*currency),
                "No live exchange rate, using fallback"
            );
        }
        debug!(rates = ?table.rates, "Rate table refreshed");
        table
    }
}

/// Keeps only the most recent base-sourced record for each target currency.
pub fn latest_rates(records: &[ExchangeRateRecord]) -> HashMap<Currency, f64> {
    let mut latest: HashMap<Currency, &ExchangeRateRecord> = HashMap::new();
    for record in records {
        if record.source_currency != BASE_CURRENCY {
            continue;
        }
        match latest.get(&record.target_currency) {
            Some(existing) if existing.timestamp >= record.timestamp => {}
            _ => {
                latest.insert(record.target_currency, record);
            }
        }
    }
    latest
        .into_iter()
        .map(|(currency, record)| (currency, record.rate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn rate_record(target: Currency, rate: f64, day: u32) -> ExchangeRateRecord {
        ExchangeRateRecord {
            source_currency: Currency::Usd,
            target_currency: target,
            rate,
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).single(),
        }
    }

    #[test]
    fn test_round_trip_within_epsilon() {
        let rates = RateTable::from_live(
            HashMap::from([(Currency::Vnd, 24_350.5), (Currency::Eur, 0.9137)]),
            &default_fallbacks(),
        );
        for currency in Currency::ALL {
            for amount in [0.0, 1.0, 13.37, 1_210.0, 99_999_999.5, -42.0] {
                let back = from_base(to_base(amount, currency, &rates), currency, &rates);
                assert!(
                    (back - amount).abs() <= 1e-9 * amount.abs().max(1.0),
                    "{currency}: {amount} came back as {back}"
                );
            }
        }
    }

    #[test]
    fn test_zero_and_non_finite_rates_use_fallback() {
        let rates = RateTable::from_live(
            HashMap::from([(Currency::Vnd, 0.0), (Currency::Eur, f64::NAN)]),
            &default_fallbacks(),
        );
        assert_eq!(rates.rate(Currency::Vnd), 25_000.0);
        assert_eq!(rates.rate(Currency::Eur), 0.92);
        assert_eq!(to_base(25_000.0, Currency::Vnd, &rates), 1.0);
        assert_eq!(rates.degraded(), &[Currency::Vnd, Currency::Eur]);
    }

    #[test]
    fn test_configured_fallback_overrides_default() {
        let mut fallbacks = default_fallbacks();
        fallbacks.insert(Currency::Vnd, 26_000.0);
        let rates = RateTable::fallback(&fallbacks);
        assert_eq!(rates.rate(Currency::Vnd), 26_000.0);
        assert_eq!(rates.rate(Currency::Usd), 1.0);
    }

    #[test]
    fn test_latest_rate_wins_per_target() {
        let records = vec![
            rate_record(Currency::Vnd, 24_000.0, 1),
            rate_record(Currency::Vnd, 25_400.0, 15),
            rate_record(Currency::Vnd, 24_800.0, 10),
            rate_record(Currency::Eur, 0.90, 2),
        ];
        let latest = latest_rates(&records);
        assert_eq!(latest.get(&Currency::Vnd), Some(&25_400.0));
        assert_eq!(latest.get(&Currency::Eur), Some(&0.90));
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!("vnd".parse::<Currency>().unwrap(), Currency::Vnd);
        assert_eq!(" EUR ".parse::<Currency>().unwrap(), Currency::Eur);
        assert!("GBP".parse::<Currency>().is_err());
    }

    #[tokio::test]
    async fn test_empty_rate_collection_falls_back_without_error() {
        let store = Arc::new(MemoryStore::new());
        let converter = CurrencyConverter::new(store, default_fallbacks());

        let rates = converter.get_rates().await;

        assert_eq!(rates.rate(Currency::Usd), 1.0);
        assert_eq!(rates.rate(Currency::Vnd), 25_000.0);
        assert_eq!(rates.rate(Currency::Eur), 0.92);
        assert_eq!(rates.degraded(), &[Currency::Vnd, Currency::Eur]);
    }

    #[tokio::test]
    async fn test_live_rates_are_loaded_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.insert_rows(
            Collection::ExchangeRates,
            vec![
                json!({"source_currency": "USD", "target_currency": "VND", "rate": 24000.0, "timestamp": "2024-01-01T00:00:00Z"}),
                json!({"source_currency": "USD", "target_currency": "VND", "rate": 25500.0, "timestamp": "2024-02-01T00:00:00Z"}),
                json!({"source_currency": "EUR", "target_currency": "VND", "rate": 27000.0, "timestamp": "2024-03-01T00:00:00Z"}),
            ],
        );
        let converter = CurrencyConverter::new(store, default_fallbacks());

        let rates = converter.get_rates().await;

        assert_eq!(rates.rate(Currency::Vnd), 25_500.0);
        assert_eq!(rates.degraded(), &[Currency::Eur]);
    }
}
