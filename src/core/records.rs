//! Strict record shapes for everything read from the store.
//!
//! Rows arrive as loosely-typed JSON. Coercion happens here, once: numeric
//! fields that are null, missing or garbage become zero, unknown enumerations
//! fall back to an `Unknown` variant, and unknown currencies fall back to the
//! base currency. Nothing untyped gets past this module.

use crate::core::currency::Currency;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    #[default]
    Unknown,
}

impl From<&str> for BookingStatus {
    fn from(s: &str) -> Self {
        match normalize_token(s).as_str() {
            "pending" => BookingStatus::Pending,
            "confirmed" => BookingStatus::Confirmed,
            "in_progress" | "inprogress" | "ongoing" => BookingStatus::InProgress,
            "completed" | "complete" | "done" => BookingStatus::Completed,
            "cancelled" | "canceled" => BookingStatus::Cancelled,
            _ => BookingStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequisitionStatus {
    Pending,
    Approved,
    Completed,
    Resolved,
    Rejected,
    Cancelled,
    Declined,
    #[default]
    Unknown,
}

impl From<&str> for RequisitionStatus {
    fn from(s: &str) -> Self {
        match normalize_token(s).as_str() {
            "pending" | "submitted" => RequisitionStatus::Pending,
            "approved" => RequisitionStatus::Approved,
            "completed" | "complete" | "done" => RequisitionStatus::Completed,
            "resolved" => RequisitionStatus::Resolved,
            "rejected" => RequisitionStatus::Rejected,
            "cancelled" | "canceled" => RequisitionStatus::Cancelled,
            "declined" => RequisitionStatus::Declined,
            _ => RequisitionStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionKind {
    Income,
    Expense,
    #[default]
    Unknown,
}

impl From<&str> for TransactionKind {
    fn from(s: &str) -> Self {
        match normalize_token(s).as_str() {
            "income" => TransactionKind::Income,
            "expense" => TransactionKind::Expense,
            _ => TransactionKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
    #[default]
    Unknown,
}

impl From<&str> for TransactionStatus {
    fn from(s: &str) -> Self {
        match normalize_token(s).as_str() {
            "pending" => TransactionStatus::Pending,
            "completed" | "complete" | "paid" => TransactionStatus::Completed,
            "cancelled" | "canceled" => TransactionStatus::Cancelled,
            _ => TransactionStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize)]
pub enum VehicleStatus {
    Available,
    Booked,
    Rented,
    Maintenance,
    OutOfService,
    #[default]
    Unknown,
}

impl VehicleStatus {
    pub const ALL: [VehicleStatus; 6] = [
        VehicleStatus::Available,
        VehicleStatus::Booked,
        VehicleStatus::Rented,
        VehicleStatus::Maintenance,
        VehicleStatus::OutOfService,
        VehicleStatus::Unknown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            VehicleStatus::Available => "Available",
            VehicleStatus::Booked => "Booked",
            VehicleStatus::Rented => "Rented",
            VehicleStatus::Maintenance => "Maintenance",
            VehicleStatus::OutOfService => "Out of service",
            VehicleStatus::Unknown => "Unknown",
        }
    }
}

impl From<&str> for VehicleStatus {
    fn from(s: &str) -> Self {
        match normalize_token(s).as_str() {
            "available" => VehicleStatus::Available,
            "booked" => VehicleStatus::Booked,
            "rented" => VehicleStatus::Rented,
            "maintenance" | "under_maintenance" => VehicleStatus::Maintenance,
            "out_of_service" | "outofservice" | "inactive" => VehicleStatus::OutOfService,
            _ => VehicleStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize)]
pub enum CapacityClass {
    SevenSeat,
    FiveSeat,
    #[default]
    Other,
}

impl CapacityClass {
    pub fn label(&self) -> &'static str {
        match self {
            CapacityClass::SevenSeat => "7-seat",
            CapacityClass::FiveSeat => "5-seat",
            CapacityClass::Other => "Other",
        }
    }
}

/// Accepts "7", "7-seat", "7 seats", "7 chỗ", "Xe 5 chỗ" and the like.
impl From<&str> for CapacityClass {
    fn from(s: &str) -> Self {
        let digits: String = s
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        match digits.as_str() {
            "7" => CapacityClass::SevenSeat,
            "5" => CapacityClass::FiveSeat,
            _ => CapacityClass::Other,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BookingRecord {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::start_instant")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::end_instant")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::parsed")]
    pub status: BookingStatus,
    #[serde(default, deserialize_with = "lenient::amount")]
    pub amount_paid: f64,
    #[serde(default, deserialize_with = "lenient::amount")]
    pub total_cost: f64,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub currency: Currency,
    #[serde(default, deserialize_with = "lenient::opt_id")]
    pub vehicle_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_id")]
    pub client_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_id")]
    pub driver_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TourBookingRecord {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::date")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub revenue: f64,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub revenue_currency: Currency,
    #[serde(default, alias = "direct_expenses", deserialize_with = "lenient::number")]
    pub expenses: f64,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub expenses_currency: Currency,
    #[serde(default, deserialize_with = "lenient::number")]
    pub vehicle_hire_cost: f64,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub vehicle_hire_currency: Currency,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransactionRecord {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, alias = "transaction_date", deserialize_with = "lenient::date")]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub amount: f64,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub currency: Currency,
    #[serde(default, rename = "type", alias = "kind", deserialize_with = "lenient::parsed")]
    pub kind: TransactionKind,
    #[serde(default, deserialize_with = "lenient::parsed")]
    pub status: TransactionStatus,
    #[serde(default, alias = "cost_requisition_id", deserialize_with = "lenient::opt_id")]
    pub requisition_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RequisitionRecord {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::date")]
    pub created_at: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::date")]
    pub completed_at: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::parsed")]
    pub status: RequisitionStatus,
    #[serde(default, deserialize_with = "lenient::text")]
    pub category: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub cost: f64,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub currency: Currency,
    #[serde(default, alias = "amount_base", deserialize_with = "lenient::opt_number")]
    pub base_amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VehicleRecord {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, alias = "license_plate", deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(default, alias = "seats", deserialize_with = "lenient::parsed")]
    pub capacity: CapacityClass,
    #[serde(default, deserialize_with = "lenient::parsed")]
    pub status: VehicleStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRateRecord {
    #[serde(default, deserialize_with = "lenient::currency")]
    pub source_currency: Currency,
    #[serde(default, deserialize_with = "lenient::currency")]
    pub target_currency: Currency,
    #[serde(default, deserialize_with = "lenient::number")]
    pub rate: f64,
    #[serde(default, alias = "updated_at", deserialize_with = "lenient::start_instant")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A client or driver, only used to turn references into display names.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NamedRecord {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(default, alias = "full_name", deserialize_with = "lenient::text")]
    pub name: String,
}

/// Records that can be placed on a calendar by their canonical date field.
pub trait Dated {
    fn canonical_date(&self) -> Option<NaiveDate>;
}

impl Dated for BookingRecord {
    fn canonical_date(&self) -> Option<NaiveDate> {
        self.start_date.map(|d| d.date_naive())
    }
}

impl Dated for TourBookingRecord {
    fn canonical_date(&self) -> Option<NaiveDate> {
        self.start_date
    }
}

impl Dated for TransactionRecord {
    fn canonical_date(&self) -> Option<NaiveDate> {
        self.date
    }
}

impl Dated for RequisitionRecord {
    fn canonical_date(&self) -> Option<NaiveDate> {
        self.created_at
    }
}

/// Coerces raw rows into `T`, dropping (and logging) rows that are not
/// objects at all. Field-level problems never drop a row.
pub fn coerce_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .enumerate()
        .filter_map(|(index, row)| match serde_json::from_value::<T>(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(row = index, error = %e, "Skipping malformed record");
                None
            }
        })
        .collect()
}

fn normalize_token(s: &str) -> String {
    s.trim().to_lowercase().replace([' ', '-'], "_")
}

pub(crate) mod lenient {
    use crate::core::currency::{BASE_CURRENCY, Currency};
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use tracing::warn;

    fn raw<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
        Option::<Value>::deserialize(deserializer)
    }

    fn as_f64(value: &Value) -> Option<f64> {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        };
        number.filter(|n| n.is_finite())
    }

    fn as_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(raw(deserializer)?.as_ref().and_then(as_f64).unwrap_or(0.0))
    }

    pub fn opt_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Ok(raw(deserializer)?.as_ref().and_then(as_f64))
    }

    /// Non-negative amount; negative values are treated as zero.
    pub fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = number(deserializer)?;
        if value < 0.0 {
            warn!(value, "Negative amount coerced to zero");
            return Ok(0.0);
        }
        Ok(value)
    }

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(raw(deserializer)?.as_ref().and_then(as_text).unwrap_or_default())
    }

    pub fn opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(raw(deserializer)?
            .as_ref()
            .and_then(as_text)
            .filter(|s| !s.trim().is_empty()))
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        id(deserializer)
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match raw(deserializer)? {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1"),
            _ => false,
        })
    }

    pub fn currency<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Currency, D::Error> {
        Ok(match raw(deserializer)? {
            Some(Value::String(code)) => code.parse().unwrap_or_else(|_| {
                warn!(code = %code, "Unknown currency, treating as {}", BASE_CURRENCY);
                BASE_CURRENCY
            }),
            _ => BASE_CURRENCY,
        })
    }

    pub fn parsed<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: for<'a> From<&'a str> + Default,
    {
        Ok(raw(deserializer)?
            .as_ref()
            .and_then(as_text)
            .map(|s| T::from(s.as_str()))
            .unwrap_or_default())
    }

    pub fn date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDate>, D::Error> {
        Ok(match raw(deserializer)? {
            Some(Value::String(s)) => parse_date(&s),
            _ => None,
        })
    }

    pub fn start_instant<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(match raw(deserializer)? {
            Some(Value::String(s)) => parse_instant(&s, NaiveTime::MIN),
            _ => None,
        })
    }

    pub fn end_instant<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        Ok(match raw(deserializer)? {
            Some(Value::String(s)) => parse_instant(&s, end_of_day),
            _ => None,
        })
    }

    /// Parses RFC 3339, Postgres-style timestamps and plain dates. A plain date
    /// is placed at `date_only_time` on that day.
    pub fn parse_instant(s: &str, date_only_time: NaiveTime) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                return Some(dt.and_utc());
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .map(|d| d.and_time(date_only_time).and_utc())
    }

    pub fn parse_date(s: &str) -> Option<NaiveDate> {
        parse_instant(s, NaiveTime::MIN).map(|dt| dt.date_naive())
    }
}
