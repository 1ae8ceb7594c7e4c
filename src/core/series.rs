//! Chart series. Each one reads the unfiltered record pool through its own
//! period selection, so none of them move when the global filter changes.

use crate::core::aggregator::{Lookups, RecordSet};
use crate::core::currency::{Currency, RateTable, from_base};
use crate::core::filter::{FilterState, Period};
use crate::core::metrics::{booking_revenue, expense_breakdown, tour_profit_total};
use crate::core::records::{
    BookingRecord, BookingStatus, CapacityClass, Dated, RequisitionRecord, VehicleRecord,
    VehicleStatus,
};
use crate::core::rules::{
    booking_revenue_base, clamp_tour_profit, counted_requisition_ids, is_expense_eligible,
    is_revenue_eligible, requisition_amount_base,
};
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const RECENT_BOOKINGS_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize)]
pub enum ExpenseCategory {
    Fuel,
    Maintenance,
    Salary,
    TollsAndParking,
    Insurance,
    Office,
    Other,
}

impl ExpenseCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ExpenseCategory::Fuel => "Fuel",
            ExpenseCategory::Maintenance => "Maintenance",
            ExpenseCategory::Salary => "Salary",
            ExpenseCategory::TollsAndParking => "Tolls & parking",
            ExpenseCategory::Insurance => "Insurance",
            ExpenseCategory::Office => "Office",
            ExpenseCategory::Other => "Other",
        }
    }
}

/// Free-text requisition categories folded into the fixed set.
impl From<&str> for ExpenseCategory {
    fn from(s: &str) -> Self {
        let s = s.trim().to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| s.contains(n));
        if has(&["fuel", "petrol", "gas", "xăng", "dầu"]) {
            ExpenseCategory::Fuel
        } else if has(&["mainten", "repair", "service", "bảo dưỡng", "sửa"]) {
            ExpenseCategory::Maintenance
        } else if has(&["salary", "wage", "payroll", "lương"]) {
            ExpenseCategory::Salary
        } else if has(&["toll", "parking", "phí cầu", "bãi đỗ", "gửi xe"]) {
            ExpenseCategory::TollsAndParking
        } else if has(&["insurance", "bảo hiểm"]) {
            ExpenseCategory::Insurance
        } else if has(&["office", "stationery", "văn phòng"]) {
            ExpenseCategory::Office
        } else {
            ExpenseCategory::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyPoint {
    /// 1-based.
    pub month: u32,
    pub revenue: f64,
    pub expenses: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySeries {
    pub year: i32,
    pub points: Vec<MonthlyPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryAmount {
    pub category: ExpenseCategory,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleRevenue {
    pub vehicle_id: String,
    pub name: String,
    pub capacity: CapacityClass,
    pub revenue: f64,
    pub trips: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub status: VehicleStatus,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityTotals {
    pub capacity: CapacityClass,
    pub revenue: f64,
    pub trips: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentBooking {
    pub id: String,
    pub start_date: Option<DateTime<Utc>>,
    pub status: BookingStatus,
    pub client: Option<String>,
    pub driver: Option<String>,
    pub amount_paid: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub monthly: MonthlySeries,
    pub expense_categories: Vec<CategoryAmount>,
    pub top_vehicles: Vec<VehicleRevenue>,
    pub fleet_status: Vec<StatusCount>,
    pub capacity_comparison: Vec<CapacityTotals>,
}

fn within<'a, T: Dated>(records: &'a [T], period: Period) -> impl Iterator<Item = &'a T> + Clone {
    records
        .iter()
        .filter(move |r| period.contains(r.canonical_date()))
}

/// Twelve buckets, January to December of `year`, each using the same
/// eligibility, clamping and dedup rules as the KPIs.
pub fn monthly_series(
    pool: &RecordSet,
    rates: &RateTable,
    currency: Currency,
    year: i32,
) -> MonthlySeries {
    let counted = counted_requisition_ids(&pool.requisitions);
    let points = (1..=12)
        .map(|month| {
            let period = Period::Month { year, month };
            let revenue = booking_revenue(within(&pool.bookings, period), rates)
                + clamp_tour_profit(tour_profit_total(within(&pool.tour_bookings, period), rates));
            let expenses = expense_breakdown(
                within(&pool.requisitions, period),
                within(&pool.transactions, period),
                &counted,
                rates,
            )
            .total();
            MonthlyPoint {
                month,
                revenue: from_base(revenue, currency, rates),
                expenses: from_base(expenses, currency, rates),
                profit: from_base(revenue - expenses, currency, rates),
            }
        })
        .collect();
    MonthlySeries { year, points }
}

/// Eligible requisition amounts per category, zero categories dropped,
/// largest first.
pub fn expense_category_series(
    requisitions: &[RequisitionRecord],
    rates: &RateTable,
    currency: Currency,
    period: Period,
) -> Vec<CategoryAmount> {
    let mut totals: BTreeMap<ExpenseCategory, f64> = BTreeMap::new();
    for cr in within(requisitions, period).filter(|cr| is_expense_eligible(cr)) {
        *totals
            .entry(ExpenseCategory::from(cr.category.as_str()))
            .or_default() += requisition_amount_base(cr, rates);
    }

    let mut series: Vec<CategoryAmount> = totals
        .into_iter()
        .filter(|(_, amount)| *amount != 0.0)
        .map(|(category, amount)| CategoryAmount {
            category,
            amount: from_base(amount, currency, rates),
        })
        .collect();
    series.sort_by(|a, b| b.amount.total_cmp(&a.amount));
    series
}

/// Revenue and trips per vehicle, highest revenue first, then most trips,
/// then first-seen order.
pub fn vehicle_revenue_series(
    pool: &RecordSet,
    rates: &RateTable,
    currency: Currency,
    period: Period,
    capacity: Option<CapacityClass>,
) -> Vec<VehicleRevenue> {
    let vehicles: HashMap<&str, &VehicleRecord> =
        pool.vehicles.iter().map(|v| (v.id.as_str(), v)).collect();
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut rows: Vec<VehicleRevenue> = Vec::new();

    for booking in within(&pool.bookings, period).filter(|b| is_revenue_eligible(b)) {
        let Some(vehicle_id) = booking.vehicle_id.as_deref() else {
            continue;
        };
        let slot = *slots.entry(vehicle_id).or_insert_with(|| {
            let vehicle = vehicles.get(vehicle_id);
            rows.push(VehicleRevenue {
                vehicle_id: vehicle_id.to_string(),
                name: vehicle
                    .map(|v| v.name.clone())
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| vehicle_id.to_string()),
                capacity: vehicle.map(|v| v.capacity).unwrap_or_default(),
                revenue: 0.0,
                trips: 0,
            });
            rows.len() - 1
        });
        rows[slot].revenue += from_base(booking_revenue_base(booking, rates), currency, rates);
        rows[slot].trips += 1;
    }

    if let Some(capacity) = capacity {
        rows.retain(|row| row.capacity == capacity);
    }
    rows.sort_by(|a, b| {
        b.revenue
            .total_cmp(&a.revenue)
            .then_with(|| b.trips.cmp(&a.trips))
    });
    rows
}

/// Current fleet snapshot; ignores every time filter.
pub fn fleet_status_series(vehicles: &[VehicleRecord]) -> Vec<StatusCount> {
    VehicleStatus::ALL
        .iter()
        .map(|status| StatusCount {
            status: *status,
            count: vehicles.iter().filter(|v| v.status == *status).count(),
        })
        .filter(|entry| entry.status != VehicleStatus::Unknown || entry.count > 0)
        .collect()
}

pub fn capacity_comparison_series(
    pool: &RecordSet,
    rates: &RateTable,
    currency: Currency,
    period: Period,
) -> Vec<CapacityTotals> {
    let rows = vehicle_revenue_series(pool, rates, currency, period, None);
    [CapacityClass::SevenSeat, CapacityClass::FiveSeat]
        .into_iter()
        .map(|capacity| {
            let matching = rows.iter().filter(|row| row.capacity == capacity);
            CapacityTotals {
                capacity,
                revenue: matching.clone().map(|row| row.revenue).sum(),
                trips: matching.map(|row| row.trips).sum(),
            }
        })
        .collect()
}

/// Most recent bookings first, references resolved to names where possible.
pub fn recent_bookings(
    bookings: &[BookingRecord],
    lookups: &Lookups,
    rates: &RateTable,
    currency: Currency,
    limit: usize,
) -> Vec<RecentBooking> {
    let mut sorted: Vec<&BookingRecord> = bookings.iter().collect();
    sorted.sort_by(|a, b| b.start_date.cmp(&a.start_date));
    sorted
        .into_iter()
        .take(limit)
        .map(|booking| RecentBooking {
            id: booking.id.clone(),
            start_date: booking.start_date,
            status: booking.status,
            client: booking.client_id.as_deref().map(|id| {
                lookups.client_name(id).unwrap_or(id).to_string()
            }),
            driver: booking.driver_id.as_deref().map(|id| {
                lookups.driver_name(id).unwrap_or(id).to_string()
            }),
            amount_paid: from_base(booking_revenue_base(booking, rates), currency, rates),
        })
        .collect()
}

pub fn compute_series(
    pool: &RecordSet,
    rates: &RateTable,
    filter: &FilterState,
    now: DateTime<Utc>,
) -> Series {
    let currency = filter.display_currency;
    let series = &filter.series;
    let year = series.monthly_trend.year().unwrap_or_else(|| now.year());

    Series {
        monthly: monthly_series(pool, rates, currency, year),
        expense_categories: expense_category_series(
            &pool.requisitions,
            rates,
            currency,
            series.expense_categories,
        ),
        top_vehicles: vehicle_revenue_series(
            pool,
            rates,
            currency,
            series.top_vehicles,
            series.top_vehicle_capacity,
        ),
        fleet_status: fleet_status_series(&pool.vehicles),
        capacity_comparison: capacity_comparison_series(
            pool,
            rates,
            currency,
            series.capacity_comparison,
        ),
    }
}
