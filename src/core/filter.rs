//! Time and currency selection: one global filter for the KPIs plus an
//! independent period per chart series.

use crate::core::currency::Currency;
use crate::core::records::CapacityClass;
use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate};
use std::fmt::Display;

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(Self {
            start,
            end: next.pred_opt()?,
        })
    }

    pub fn year(year: i32) -> Option<Self> {
        Some(Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// First day after the window, for stores that filter timestamps with `<`.
    pub fn end_exclusive(&self) -> Option<NaiveDate> {
        self.end.succ_opt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    AllTime,
    Year(i32),
    /// `month` is 1-based.
    Month { year: i32, month: u32 },
}

impl Period {
    pub fn month(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            bail!("Invalid month index: {} (expected 1-12)", month);
        }
        Ok(Period::Month { year, month })
    }

    pub fn window(&self) -> Option<DateWindow> {
        match self {
            Period::AllTime => None,
            Period::Year(year) => DateWindow::year(*year),
            Period::Month { year, month } => DateWindow::month(*year, *month),
        }
    }

    pub fn year(&self) -> Option<i32> {
        match self {
            Period::AllTime => None,
            Period::Year(year) | Period::Month { year, .. } => Some(*year),
        }
    }

    pub fn contains(&self, date: Option<NaiveDate>) -> bool {
        match (self.window(), date) {
            (None, _) => true,
            (Some(window), Some(date)) => window.contains(date),
            (Some(_), None) => false,
        }
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Period::AllTime => write!(f, "All time"),
            Period::Year(year) => write!(f, "{year}"),
            Period::Month { year, month } => write!(f, "{year}-{month:02}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    AllTime,
    PerPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthSelector {
    All,
    Month(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesId {
    MonthlyTrend,
    ExpenseCategories,
    TopVehicles,
    CapacityComparison,
}

/// Per-visualization selections, decoupled from the global filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFilters {
    pub monthly_trend: Period,
    pub expense_categories: Period,
    pub top_vehicles: Period,
    pub capacity_comparison: Period,
    pub top_vehicle_capacity: Option<CapacityClass>,
}

impl SeriesFilters {
    pub fn get(&self, id: SeriesId) -> Period {
        match id {
            SeriesId::MonthlyTrend => self.monthly_trend,
            SeriesId::ExpenseCategories => self.expense_categories,
            SeriesId::TopVehicles => self.top_vehicles,
            SeriesId::CapacityComparison => self.capacity_comparison,
        }
    }

    fn slot(&mut self, id: SeriesId) -> &mut Period {
        match id {
            SeriesId::MonthlyTrend => &mut self.monthly_trend,
            SeriesId::ExpenseCategories => &mut self.expense_categories,
            SeriesId::TopVehicles => &mut self.top_vehicles,
            SeriesId::CapacityComparison => &mut self.capacity_comparison,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub mode: FilterMode,
    pub month: MonthSelector,
    pub year: i32,
    pub display_currency: Currency,
    pub series: SeriesFilters,
}

impl FilterState {
    /// All-time KPIs, current month/year preselected for when the user
    /// switches to per-period mode.
    pub fn new(today: NaiveDate, display_currency: Currency) -> Self {
        Self {
            mode: FilterMode::AllTime,
            month: MonthSelector::Month(today.month()),
            year: today.year(),
            display_currency,
            series: SeriesFilters {
                monthly_trend: Period::Year(today.year()),
                expense_categories: Period::AllTime,
                top_vehicles: Period::AllTime,
                capacity_comparison: Period::AllTime,
                top_vehicle_capacity: None,
            },
        }
    }

    /// The period the global filter currently selects.
    pub fn global_period(&self) -> Period {
        match (self.mode, self.month) {
            (FilterMode::AllTime, _) => Period::AllTime,
            (FilterMode::PerPeriod, MonthSelector::All) => Period::Year(self.year),
            (FilterMode::PerPeriod, MonthSelector::Month(month)) => Period::Month {
                year: self.year,
                month,
            },
        }
    }

    pub fn global_window(&self) -> Option<DateWindow> {
        self.global_period().window()
    }

    pub fn set_mode(&mut self, mode: FilterMode) {
        self.mode = mode;
    }

    pub fn set_period(&mut self, month: MonthSelector, year: i32) -> Result<()> {
        if let MonthSelector::Month(index) = month {
            if !(1..=12).contains(&index) {
                bail!("Invalid month index: {} (expected 1-12)", index);
            }
        }
        self.month = month;
        self.year = year;
        Ok(())
    }

    pub fn set_display_currency(&mut self, currency: Currency) {
        self.display_currency = currency;
    }

    pub fn set_series_filter(&mut self, id: SeriesId, period: Period) {
        *self.series.slot(id) = period;
    }

    pub fn set_vehicle_capacity_filter(&mut self, capacity: Option<CapacityClass>) {
        self.series.top_vehicle_capacity = capacity;
    }
}
