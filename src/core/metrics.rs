//! KPI calculation. Pure: identical inputs always give identical outputs.
//!
//! Amounts are summed in the base currency and converted to the display
//! currency only when a KPI is produced.

use crate::core::aggregator::{AggregatedRecords, RecordSet};
use crate::core::currency::{Currency, RateTable, from_base, to_base};
use crate::core::filter::{FilterState, Period};
use crate::core::records::{
    BookingRecord, RequisitionRecord, TourBookingRecord, TransactionRecord, VehicleRecord,
};
use crate::core::rules::{
    self, ActiveScope, booking_revenue_base, clamp_tour_profit, counted_requisition_ids,
    is_duplicate_expense, is_expense_eligible, is_expense_transaction, is_income_transaction,
    is_revenue_eligible, requisition_amount_base, tour_profit_base, transaction_amount_base,
};
use crate::core::series::{self, RecentBooking, Series};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// Revenue components, base currency.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RevenueBreakdown {
    pub bookings: f64,
    pub tour_profit_raw: f64,
    pub tour_contribution: f64,
    pub income: f64,
}

impl RevenueBreakdown {
    pub fn total(&self) -> f64 {
        self.bookings + self.tour_contribution + self.income
    }
}

/// Expense components, base currency.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExpenseBreakdown {
    pub requisitions: f64,
    pub transactions: f64,
}

impl ExpenseBreakdown {
    pub fn total(&self) -> f64 {
        self.requisitions + self.transactions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FleetUtilization {
    pub total: usize,
    pub hired: usize,
    pub under_maintenance: usize,
    pub available: usize,
    pub utilization_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct OutstandingPayments {
    pub amount: f64,
    pub count: usize,
}

/// Every KPI card, display currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpis {
    pub currency: Currency,
    pub total_revenue: f64,
    pub booking_revenue: f64,
    pub tour_profit: f64,
    pub tour_profit_raw: f64,
    pub income_transactions: f64,
    pub total_expenses: f64,
    pub requisition_expenses: f64,
    pub transaction_expenses: f64,
    pub net_profit: f64,
    pub fleet: FleetUtilization,
    pub active_bookings: usize,
    pub outstanding: OutstandingPayments,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardMetrics {
    pub kpis: Kpis,
    pub series: Series,
    pub recent_bookings: Vec<RecentBooking>,
    /// Tour bookings in the global window that lost money, unclamped.
    pub tours_at_loss: Vec<TourProfit>,
}

/// A single tour booking's true profit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TourProfit {
    pub id: String,
    pub profit: f64,
}

pub fn booking_revenue<'a>(
    bookings: impl IntoIterator<Item = &'a BookingRecord>,
    rates: &RateTable,
) -> f64 {
    bookings
        .into_iter()
        .filter(|b| is_revenue_eligible(b))
        .map(|b| booking_revenue_base(b, rates))
        .sum()
}

/// Unclamped sum of per-record tour profit.
pub fn tour_profit_total<'a>(
    tours: impl IntoIterator<Item = &'a TourBookingRecord>,
    rates: &RateTable,
) -> f64 {
    tours.into_iter().map(|t| tour_profit_base(t, rates)).sum()
}

/// Per-record profit, negatives included as-is.
pub fn tour_profit_breakdown(tours: &[TourBookingRecord], rates: &RateTable) -> Vec<TourProfit> {
    tours
        .iter()
        .map(|tour| {
            let profit = tour_profit_base(tour, rates);
            if profit < 0.0 {
                debug!(tour = %tour.id, profit, "Tour booking ran at a loss");
            }
            TourProfit {
                id: tour.id.clone(),
                profit,
            }
        })
        .collect()
}

pub fn income_total<'a>(
    transactions: impl IntoIterator<Item = &'a TransactionRecord>,
    rates: &RateTable,
) -> f64 {
    transactions
        .into_iter()
        .filter(|tx| is_income_transaction(tx))
        .map(|tx| transaction_amount_base(tx, rates))
        .sum()
}

pub fn revenue_breakdown<'a>(
    bookings: impl IntoIterator<Item = &'a BookingRecord>,
    tours: impl IntoIterator<Item = &'a TourBookingRecord>,
    transactions: impl IntoIterator<Item = &'a TransactionRecord>,
    rates: &RateTable,
) -> RevenueBreakdown {
    let tour_profit_raw = tour_profit_total(tours, rates);
    RevenueBreakdown {
        bookings: booking_revenue(bookings, rates),
        tour_profit_raw,
        tour_contribution: clamp_tour_profit(tour_profit_raw),
        income: income_total(transactions, rates),
    }
}

/// Requisitions first; an expense transaction linked to any requisition in
/// `counted` is then skipped. `counted` comes from the whole requisition
/// history, not just `requisitions`, so a transaction dated in a later month
/// than its requisition is still recognised.
pub fn expense_breakdown<'a, R, T>(
    requisitions: R,
    transactions: T,
    counted: &HashSet<&str>,
    rates: &RateTable,
) -> ExpenseBreakdown
where
    R: IntoIterator<Item = &'a RequisitionRecord>,
    T: IntoIterator<Item = &'a TransactionRecord>,
{
    let requisitions_total: f64 = requisitions
        .into_iter()
        .filter(|cr| is_expense_eligible(cr))
        .map(|cr| requisition_amount_base(cr, rates))
        .sum();
    let transactions_total: f64 = transactions
        .into_iter()
        .filter(|tx| is_expense_transaction(tx))
        .filter(|tx| {
            let duplicate = is_duplicate_expense(tx, counted);
            if duplicate {
                debug!(transaction = %tx.id, "Skipping transaction already counted via requisition");
            }
            !duplicate
        })
        .map(|tx| transaction_amount_base(tx, rates))
        .sum();
    ExpenseBreakdown {
        requisitions: requisitions_total,
        transactions: transactions_total,
    }
}

pub fn fleet_utilization(vehicles: &[VehicleRecord]) -> FleetUtilization {
    let total = vehicles.len();
    let hired = vehicles.iter().filter(|v| rules::is_hired(v)).count();
    let under_maintenance = vehicles
        .iter()
        .filter(|v| rules::is_under_maintenance(v))
        .count();
    let available = vehicles.iter().filter(|v| rules::is_available(v)).count();
    let utilization_pct = if total == 0 {
        0.0
    } else {
        hired as f64 / total as f64 * 100.0
    };
    FleetUtilization {
        total,
        hired,
        under_maintenance,
        available,
        utilization_pct,
    }
}

pub fn active_bookings(bookings: &[BookingRecord], period: Period, now: DateTime<Utc>) -> usize {
    let scope = match period {
        Period::AllTime => ActiveScope::AllTime { now },
        _ => ActiveScope::Period,
    };
    bookings
        .iter()
        .filter(|b| rules::is_active_booking(b, scope))
        .count()
}

/// Base-currency amount and count of bookings with an open balance.
pub fn outstanding_payments(bookings: &[BookingRecord], rates: &RateTable) -> OutstandingPayments {
    bookings
        .iter()
        .filter_map(|b| {
            rules::outstanding_balance(b)
                .map(|owed| to_base(owed, b.currency, rates))
        })
        .fold(OutstandingPayments::default(), |acc, owed| OutstandingPayments {
            amount: acc.amount + owed,
            count: acc.count + 1,
        })
}

/// KPIs over records already restricted to the global window.
pub fn compute_kpis(
    records: &RecordSet,
    counted: &HashSet<&str>,
    rates: &RateTable,
    filter: &FilterState,
    now: DateTime<Utc>,
) -> Kpis {
    let currency = filter.display_currency;
    let display = |amount: f64| from_base(amount, currency, rates);

    let revenue = revenue_breakdown(
        &records.bookings,
        &records.tour_bookings,
        &records.transactions,
        rates,
    );
    let expenses = expense_breakdown(
        &records.requisitions,
        &records.transactions,
        counted,
        rates,
    );
    let outstanding = outstanding_payments(&records.bookings, rates);

    debug!(
        ?revenue,
        ?expenses,
        "Computed base-currency revenue and expenses"
    );

    Kpis {
        currency,
        total_revenue: display(revenue.total()),
        booking_revenue: display(revenue.bookings),
        tour_profit: display(revenue.tour_contribution),
        tour_profit_raw: display(revenue.tour_profit_raw),
        income_transactions: display(revenue.income),
        total_expenses: display(expenses.total()),
        requisition_expenses: display(expenses.requisitions),
        transaction_expenses: display(expenses.transactions),
        net_profit: display(revenue.total() - expenses.total()),
        fleet: fleet_utilization(&records.vehicles),
        active_bookings: active_bookings(&records.bookings, filter.global_period(), now),
        outstanding: OutstandingPayments {
            amount: display(outstanding.amount),
            count: outstanding.count,
        },
    }
}

/// The full recomputation: KPIs from the global window, series from the
/// unfiltered pool under their own filters.
pub fn calculate(
    records: &AggregatedRecords,
    rates: &RateTable,
    filter: &FilterState,
    now: DateTime<Utc>,
) -> DashboardMetrics {
    let counted =
        counted_requisition_ids(records.window.requisitions.iter().chain(&records.pool.requisitions));
    DashboardMetrics {
        kpis: compute_kpis(&records.window, &counted, rates, filter, now),
        series: series::compute_series(&records.pool, rates, filter, now),
        recent_bookings: series::recent_bookings(
            &records.window.bookings,
            &records.lookups,
            rates,
            filter.display_currency,
            series::RECENT_BOOKINGS_LIMIT,
        ),
        tours_at_loss: tour_profit_breakdown(&records.window.tour_bookings, rates)
            .into_iter()
            .filter(|tour| tour.profit < 0.0)
            .map(|tour| TourProfit {
                profit: from_base(tour.profit, filter.display_currency, rates),
                ..tour
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::default_fallbacks;
    use crate::core::filter::{FilterMode, MonthSelector};
    use crate::core::records::{
        BookingStatus, RequisitionStatus, TransactionKind, TransactionStatus, VehicleStatus,
    };
    use chrono::TimeZone;

    fn rates() -> RateTable {
        RateTable::fallback(&default_fallbacks())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, 9, 0, 0).unwrap()
    }

    fn filter() -> FilterState {
        FilterState::new(now().date_naive(), Currency::Usd)
    }

    fn kpis_for(records: &RecordSet, filter: &FilterState) -> Kpis {
        let counted = counted_requisition_ids(&records.requisitions);
        compute_kpis(records, &counted, &rates(), filter, now())
    }

    fn booking(id: &str, status: BookingStatus, paid: f64) -> BookingRecord {
        BookingRecord {
            id: id.to_string(),
            status,
            amount_paid: paid,
            total_cost: paid,
            start_date: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).single(),
            end_date: Utc.with_ymd_and_hms(2024, 3, 4, 23, 59, 59).single(),
            ..Default::default()
        }
    }

    fn tour(id: &str, revenue: f64, expenses: f64, hire: f64) -> TourBookingRecord {
        TourBookingRecord {
            id: id.to_string(),
            revenue,
            expenses,
            vehicle_hire_cost: hire,
            ..Default::default()
        }
    }

    fn vehicle(status: VehicleStatus) -> VehicleRecord {
        VehicleRecord {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_scenario_four_bookings_one_month() {
        let records = RecordSet {
            bookings: vec![
                booking("b1", BookingStatus::InProgress, 1210.0),
                booking("b2", BookingStatus::InProgress, 1760.0),
                booking("b3", BookingStatus::InProgress, 50.0),
                booking("b4", BookingStatus::Completed, 660.0),
            ],
            ..Default::default()
        };

        let kpis = kpis_for(&records, &filter());

        assert_eq!(kpis.total_revenue, 3680.0);
        assert_eq!(kpis.booking_revenue, 3680.0);
        assert_eq!(kpis.tour_profit, 0.0);
    }

    #[test]
    fn test_scenario_fleet_utilization() {
        let mut vehicles = vec![
            vehicle(VehicleStatus::Booked),
            vehicle(VehicleStatus::Rented),
            vehicle(VehicleStatus::Rented),
            vehicle(VehicleStatus::Booked),
            vehicle(VehicleStatus::Maintenance),
            vehicle(VehicleStatus::OutOfService),
        ];
        vehicles.extend((0..9).map(|_| vehicle(VehicleStatus::Available)));

        let fleet = fleet_utilization(&vehicles);

        assert_eq!(fleet.total, 15);
        assert_eq!(fleet.hired, 4);
        assert_eq!(fleet.under_maintenance, 2);
        assert_eq!(fleet.available, 9);
        assert!((fleet.utilization_pct - 26.67).abs() < 0.01);
    }

    #[test]
    fn test_empty_fleet_has_zero_utilization() {
        assert_eq!(fleet_utilization(&[]).utilization_pct, 0.0);
    }

    #[test]
    fn test_scenario_requisition_counted_once() {
        let requisitions = vec![RequisitionRecord {
            id: "cr-9".to_string(),
            status: RequisitionStatus::Completed,
            cost: 300.0,
            ..Default::default()
        }];
        let transactions = vec![
            TransactionRecord {
                id: "tx-1".to_string(),
                kind: TransactionKind::Expense,
                amount: 300.0,
                requisition_id: Some("cr-9".to_string()),
                ..Default::default()
            },
            TransactionRecord {
                id: "tx-2".to_string(),
                kind: TransactionKind::Expense,
                amount: 45.0,
                ..Default::default()
            },
        ];

        let expenses = expense_breakdown(
            &requisitions,
            &transactions,
            &counted_requisition_ids(&requisitions),
            &rates(),
        );

        assert_eq!(expenses.requisitions, 300.0);
        assert_eq!(expenses.transactions, 45.0);
        assert_eq!(expenses.total(), 345.0);
    }

    #[test]
    fn test_period_kpis_skip_transaction_linked_to_earlier_requisition() {
        let requisition = RequisitionRecord {
            id: "cr-7".to_string(),
            status: RequisitionStatus::Completed,
            cost: 300.0,
            created_at: chrono::NaiveDate::from_ymd_opt(2024, 3, 30),
            ..Default::default()
        };
        let transaction = TransactionRecord {
            id: "tx-7".to_string(),
            kind: TransactionKind::Expense,
            amount: 300.0,
            date: chrono::NaiveDate::from_ymd_opt(2024, 4, 2),
            requisition_id: Some("cr-7".to_string()),
            ..Default::default()
        };
        let records = AggregatedRecords {
            window: RecordSet {
                transactions: vec![transaction.clone()],
                ..Default::default()
            },
            pool: RecordSet {
                requisitions: vec![requisition],
                transactions: vec![transaction],
                ..Default::default()
            },
            ..Default::default()
        };
        let mut april = filter();
        april.set_mode(FilterMode::PerPeriod);
        april.set_period(MonthSelector::Month(4), 2024).unwrap();

        let metrics = calculate(&records, &rates(), &april, now());

        assert_eq!(metrics.kpis.total_expenses, 0.0);
        assert_eq!(metrics.kpis.transaction_expenses, 0.0);
    }

    #[test]
    fn test_transaction_linked_to_ineligible_requisition_still_counts() {
        let requisitions = vec![RequisitionRecord {
            id: "cr-1".to_string(),
            status: RequisitionStatus::Rejected,
            cost: 300.0,
            ..Default::default()
        }];
        let transactions = vec![TransactionRecord {
            kind: TransactionKind::Expense,
            amount: 300.0,
            requisition_id: Some("cr-1".to_string()),
            ..Default::default()
        }];

        let expenses = expense_breakdown(
            &requisitions,
            &transactions,
            &counted_requisition_ids(&requisitions),
            &rates(),
        );

        assert_eq!(expenses.total(), 300.0);
    }

    #[test]
    fn test_negative_tour_total_is_clamped_but_logged_raw() {
        let tours = vec![tour("t1", 100.0, 150.0, 20.0), tour("t2", 30.0, 0.0, 0.0)];

        let breakdown = tour_profit_breakdown(&tours, &rates());
        assert_eq!(breakdown[0].profit, -70.0);
        assert_eq!(breakdown[1].profit, 30.0);

        let records = RecordSet {
            tour_bookings: tours,
            ..Default::default()
        };
        let kpis = kpis_for(&records, &filter());
        assert_eq!(kpis.tour_profit, 0.0);
        assert_eq!(kpis.tour_profit_raw, -40.0);
        assert_eq!(kpis.total_revenue, 0.0);
    }

    #[test]
    fn test_clamp_is_aggregate_not_per_record() {
        let tours = vec![tour("t1", 100.0, 150.0, 0.0), tour("t2", 80.0, 0.0, 0.0)];
        let records = RecordSet {
            tour_bookings: tours,
            ..Default::default()
        };

        let kpis = kpis_for(&records, &filter());

        // -50 + 80, not 0 + 80
        assert_eq!(kpis.tour_profit, 30.0);
    }

    #[test]
    fn test_total_revenue_combines_sources_and_skips_cancelled() {
        let records = RecordSet {
            bookings: vec![
                booking("b1", BookingStatus::Completed, 100.0),
                booking("b2", BookingStatus::Confirmed, 0.0),
                booking("b3", BookingStatus::Cancelled, 500.0),
            ],
            tour_bookings: vec![tour("t1", 60.0, 10.0, 0.0)],
            transactions: vec![
                TransactionRecord {
                    kind: TransactionKind::Income,
                    amount: 25.0,
                    ..Default::default()
                },
                TransactionRecord {
                    kind: TransactionKind::Income,
                    amount: 999.0,
                    status: TransactionStatus::Cancelled,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let kpis = kpis_for(&records, &filter());

        assert_eq!(kpis.total_revenue, 175.0);
        assert_eq!(kpis.income_transactions, 25.0);
        assert_eq!(kpis.net_profit, 175.0);
    }

    #[test]
    fn test_amounts_normalized_before_summing_and_converted_on_output() {
        let mut vnd = booking("b1", BookingStatus::Completed, 2_500_000.0);
        vnd.currency = Currency::Vnd;
        let records = RecordSet {
            bookings: vec![vnd, booking("b2", BookingStatus::Completed, 50.0)],
            ..Default::default()
        };
        let mut filter = filter();
        filter.set_display_currency(Currency::Vnd);

        let kpis = kpis_for(&records, &filter);

        assert_eq!(kpis.currency, Currency::Vnd);
        assert!((kpis.total_revenue - 3_750_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_active_bookings_depend_on_filter_mode() {
        let mut upcoming = booking("b2", BookingStatus::Confirmed, 0.0);
        upcoming.start_date = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).single();
        upcoming.end_date = Utc.with_ymd_and_hms(2024, 3, 22, 0, 0, 0).single();
        let mut current = booking("b3", BookingStatus::Confirmed, 0.0);
        current.start_date = Utc.with_ymd_and_hms(2024, 3, 13, 0, 0, 0).single();
        current.end_date = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).single();
        let bookings = vec![
            booking("b1", BookingStatus::InProgress, 0.0),
            upcoming,
            current,
            booking("b4", BookingStatus::Completed, 0.0),
        ];

        assert_eq!(active_bookings(&bookings, Period::AllTime, now()), 2);
        let march = Period::month(2024, 3).unwrap();
        assert_eq!(active_bookings(&bookings, march, now()), 3);

        let mut filter = filter();
        filter.set_mode(FilterMode::PerPeriod);
        filter.set_period(MonthSelector::Month(3), 2024).unwrap();
        let records = RecordSet {
            bookings,
            ..Default::default()
        };
        assert_eq!(kpis_for(&records, &filter).active_bookings, 3);
    }

    #[test]
    fn test_outstanding_payments() {
        let mut partly_paid = booking("b1", BookingStatus::Confirmed, 40.0);
        partly_paid.total_cost = 100.0;
        let mut running = booking("b2", BookingStatus::InProgress, 0.0);
        running.total_cost = 2_500_000.0;
        running.currency = Currency::Vnd;
        let mut done = booking("b3", BookingStatus::Completed, 0.0);
        done.total_cost = 70.0;

        let outstanding = outstanding_payments(&[partly_paid, running, done], &rates());

        assert_eq!(outstanding.count, 2);
        assert!((outstanding.amount - 160.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculation_is_idempotent() {
        let records = AggregatedRecords {
            window: RecordSet {
                bookings: vec![booking("b1", BookingStatus::Completed, 10.0)],
                vehicles: vec![vehicle(VehicleStatus::Booked)],
                ..Default::default()
            },
            ..Default::default()
        };
        let first = calculate(&records, &rates(), &filter(), now());
        let second = calculate(&records, &rates(), &filter(), now());
        assert_eq!(first, second);
    }
}
