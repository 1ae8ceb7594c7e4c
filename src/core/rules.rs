//! Eligibility and deduplication rules, one function per rule so each can be
//! checked on its own against the web dashboard's behaviour.

use crate::core::currency::{RateTable, to_base};
use crate::core::records::{
    BookingRecord, BookingStatus, RequisitionRecord, RequisitionStatus, TourBookingRecord,
    TransactionKind, TransactionRecord, TransactionStatus, VehicleRecord, VehicleStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Completed or in progress, or confirmed with money already received.
pub fn is_revenue_eligible(booking: &BookingRecord) -> bool {
    match booking.status {
        BookingStatus::Completed | BookingStatus::InProgress => true,
        BookingStatus::Confirmed => booking.amount_paid > 0.0,
        _ => false,
    }
}

pub fn booking_revenue_base(booking: &BookingRecord, rates: &RateTable) -> f64 {
    to_base(booking.amount_paid, booking.currency, rates)
}

/// Revenue minus direct expenses and vehicle hire, each leg converted on its
/// own. May be negative.
pub fn tour_profit_base(tour: &TourBookingRecord, rates: &RateTable) -> f64 {
    let revenue = to_base(tour.revenue, tour.revenue_currency, rates);
    let expenses = to_base(tour.expenses, tour.expenses_currency, rates);
    let hire = to_base(tour.vehicle_hire_cost, tour.vehicle_hire_currency, rates);
    revenue - (expenses + hire)
}

/// Applied to the sum over a set of tours, never per tour.
pub fn clamp_tour_profit(total_profit: f64) -> f64 {
    total_profit.max(0.0)
}

pub fn is_cancelled_transaction(tx: &TransactionRecord) -> bool {
    tx.status == TransactionStatus::Cancelled
}

pub fn is_income_transaction(tx: &TransactionRecord) -> bool {
    tx.kind == TransactionKind::Income && !is_cancelled_transaction(tx)
}

pub fn is_expense_transaction(tx: &TransactionRecord) -> bool {
    tx.kind == TransactionKind::Expense && !is_cancelled_transaction(tx)
}

pub fn transaction_amount_base(tx: &TransactionRecord, rates: &RateTable) -> f64 {
    to_base(tx.amount, tx.currency, rates)
}

pub fn is_excluded_requisition(cr: &RequisitionRecord) -> bool {
    cr.is_deleted
        || matches!(
            cr.status,
            RequisitionStatus::Rejected | RequisitionStatus::Cancelled | RequisitionStatus::Declined
        )
}

/// Has a completion date or a terminal-positive status, and is neither
/// soft-deleted nor rejected/cancelled/declined.
pub fn is_expense_eligible(cr: &RequisitionRecord) -> bool {
    if is_excluded_requisition(cr) {
        return false;
    }
    cr.completed_at.is_some()
        || matches!(
            cr.status,
            RequisitionStatus::Completed | RequisitionStatus::Approved | RequisitionStatus::Resolved
        )
}

/// The pre-converted base amount when the store has one, otherwise the raw
/// cost converted here.
pub fn requisition_amount_base(cr: &RequisitionRecord, rates: &RateTable) -> f64 {
    match cr.base_amount {
        Some(amount) => amount,
        None => to_base(cr.cost, cr.currency, rates),
    }
}

/// Ids of the requisitions that will be counted as expenses.
pub fn counted_requisition_ids<'a, I>(requisitions: I) -> HashSet<&'a str>
where
    I: IntoIterator<Item = &'a RequisitionRecord>,
{
    requisitions
        .into_iter()
        .filter(|cr| is_expense_eligible(cr))
        .map(|cr| cr.id.as_str())
        .collect()
}

/// An expense transaction that points back at a requisition already counted
/// is the same real-world expense and must not be counted again.
pub fn is_duplicate_expense(tx: &TransactionRecord, counted: &HashSet<&str>) -> bool {
    tx.requisition_id
        .as_deref()
        .is_some_and(|id| counted.contains(id))
}

pub fn is_hired(vehicle: &VehicleRecord) -> bool {
    matches!(vehicle.status, VehicleStatus::Booked | VehicleStatus::Rented)
}

pub fn is_under_maintenance(vehicle: &VehicleRecord) -> bool {
    matches!(
        vehicle.status,
        VehicleStatus::Maintenance | VehicleStatus::OutOfService
    )
}

pub fn is_available(vehicle: &VehicleRecord) -> bool {
    vehicle.status == VehicleStatus::Available
}

/// How "active" is judged depends on whether a period is selected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveScope {
    /// In progress, or confirmed and running at `now`.
    AllTime { now: DateTime<Utc> },
    /// In progress or confirmed; the records are already period-filtered.
    Period,
}

pub fn is_active_booking(booking: &BookingRecord, scope: ActiveScope) -> bool {
    match (booking.status, scope) {
        (BookingStatus::InProgress, _) => true,
        (BookingStatus::Confirmed, ActiveScope::Period) => true,
        (BookingStatus::Confirmed, ActiveScope::AllTime { now }) => {
            match (booking.start_date, booking.end_date) {
                (Some(start), Some(end)) => start <= now && now <= end,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Remaining balance in the booking's own currency, if anything is owed.
pub fn outstanding_balance(booking: &BookingRecord) -> Option<f64> {
    let owes = matches!(
        booking.status,
        BookingStatus::Confirmed | BookingStatus::InProgress
    ) && booking.amount_paid < booking.total_cost;
    owes.then(|| booking.total_cost - booking.amount_paid)
}
