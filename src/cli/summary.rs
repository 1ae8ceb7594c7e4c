use super::ui;
use crate::core::aggregator::{FetchWarning, RecordAggregator};
use crate::core::currency::{Currency, CurrencyConverter};
use crate::core::filter::FilterState;
use crate::core::metrics::{DashboardMetrics, calculate};
use crate::core::store::RecordStore;
use anyhow::{Result, bail};
use chrono::Utc;
use comfy_table::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const TOP_VEHICLES_SHOWN: usize = 5;

impl DashboardMetrics {
    pub fn display_as_table(&self, filter: &FilterState) -> String {
        let currency = self.kpis.currency;
        let mut output = format!(
            "Dashboard: {} ({})\n\n",
            ui::style_text(&filter.global_period().to_string(), ui::StyleType::Title),
            currency
        );

        output.push_str(&self.kpi_table().to_string());
        output.push_str(&format!(
            "\n\nNet profit ({}): {}\n",
            ui::style_text(currency.code(), ui::StyleType::TotalLabel),
            ui::style_text(
                &ui::format_amount(self.kpis.net_profit, currency),
                if self.kpis.net_profit >= 0.0 {
                    ui::StyleType::TotalValue
                } else {
                    ui::StyleType::Error
                }
            )
        ));

        let sections = [
            (
                format!("Monthly trend {}", self.series.monthly.year),
                Some(self.monthly_table()),
            ),
            (
                format!("Expenses by category ({})", filter.series.expense_categories),
                (!self.series.expense_categories.is_empty()).then(|| self.category_table()),
            ),
            (
                format!("Top vehicles ({})", filter.series.top_vehicles),
                (!self.series.top_vehicles.is_empty()).then(|| self.vehicle_table()),
            ),
            (
                format!("Capacity comparison ({})", filter.series.capacity_comparison),
                Some(self.capacity_table()),
            ),
            ("Fleet status".to_string(), Some(self.fleet_table())),
            (
                "Recent bookings".to_string(),
                (!self.recent_bookings.is_empty()).then(|| self.recent_table()),
            ),
            (
                "Tours at a loss".to_string(),
                (!self.tours_at_loss.is_empty()).then(|| self.loss_table()),
            ),
        ];
        for (title, table) in sections {
            output.push_str(&format!(
                "\n{}\n",
                ui::style_text(&title, ui::StyleType::TotalLabel)
            ));
            match table {
                Some(table) => output.push_str(&table.to_string()),
                None => output.push_str(&ui::style_text("No data", ui::StyleType::Subtle)),
            }
            output.push('\n');
        }
        output
    }

    fn kpi_table(&self) -> comfy_table::Table {
        let k = &self.kpis;
        let c = k.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![ui::header_cell("Metric"), ui::header_cell("Value")]);

        let amounts = [
            ("Total revenue", k.total_revenue),
            ("  Bookings", k.booking_revenue),
            ("  Tour profit", k.tour_profit),
            ("  Income transactions", k.income_transactions),
            ("Total expenses", k.total_expenses),
            ("  Requisitions", k.requisition_expenses),
            ("  Other transactions", k.transaction_expenses),
        ];
        for (label, value) in amounts {
            table.add_row(vec![Cell::new(label), ui::amount_cell(value, c)]);
        }
        if k.tour_profit_raw < 0.0 {
            table.add_row(vec![
                Cell::new("  Tour result before clamp"),
                ui::signed_amount_cell(k.tour_profit_raw, c),
            ]);
        }
        table.add_row(vec![
            Cell::new("Net profit"),
            ui::signed_amount_cell(k.net_profit, c),
        ]);
        table.add_row(vec![
            Cell::new("Active bookings"),
            ui::count_cell(k.active_bookings),
        ]);
        table.add_row(vec![
            Cell::new(format!("Outstanding ({} bookings)", k.outstanding.count)),
            ui::amount_cell(k.outstanding.amount, c),
        ]);
        table.add_row(vec![
            Cell::new(format!(
                "Fleet utilization ({}/{} hired)",
                k.fleet.hired, k.fleet.total
            )),
            Cell::new(format!("{:.1}%", k.fleet.utilization_pct))
                .set_alignment(comfy_table::CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new("Available / in maintenance"),
            Cell::new(format!(
                "{} / {}",
                k.fleet.available, k.fleet.under_maintenance
            ))
            .set_alignment(comfy_table::CellAlignment::Right),
        ]);
        table
    }

    fn monthly_table(&self) -> comfy_table::Table {
        let c = self.kpis.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Month"),
            ui::header_cell(&format!("Revenue ({c})")),
            ui::header_cell(&format!("Expenses ({c})")),
            ui::header_cell(&format!("Profit ({c})")),
        ]);
        for point in &self.series.monthly.points {
            table.add_row(vec![
                Cell::new(format!("{}-{:02}", self.series.monthly.year, point.month)),
                ui::amount_cell(point.revenue, c),
                ui::amount_cell(point.expenses, c),
                ui::signed_amount_cell(point.profit, c),
            ]);
        }
        table
    }

    fn category_table(&self) -> comfy_table::Table {
        let c = self.kpis.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Category"),
            ui::header_cell(&format!("Amount ({c})")),
        ]);
        for entry in &self.series.expense_categories {
            table.add_row(vec![
                Cell::new(entry.category.label()),
                ui::amount_cell(entry.amount, c),
            ]);
        }
        table
    }

    fn vehicle_table(&self) -> comfy_table::Table {
        let c = self.kpis.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Vehicle"),
            ui::header_cell("Capacity"),
            ui::header_cell("Trips"),
            ui::header_cell(&format!("Revenue ({c})")),
        ]);
        for vehicle in self.series.top_vehicles.iter().take(TOP_VEHICLES_SHOWN) {
            table.add_row(vec![
                Cell::new(&vehicle.name),
                Cell::new(vehicle.capacity.label()),
                ui::count_cell(vehicle.trips),
                ui::amount_cell(vehicle.revenue, c),
            ]);
        }
        table
    }

    fn capacity_table(&self) -> comfy_table::Table {
        let c = self.kpis.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Capacity"),
            ui::header_cell("Trips"),
            ui::header_cell(&format!("Revenue ({c})")),
        ]);
        for entry in &self.series.capacity_comparison {
            table.add_row(vec![
                Cell::new(entry.capacity.label()),
                ui::count_cell(entry.trips),
                ui::amount_cell(entry.revenue, c),
            ]);
        }
        table
    }

    fn fleet_table(&self) -> comfy_table::Table {
        let mut table = ui::new_styled_table();
        table.set_header(vec![ui::header_cell("Status"), ui::header_cell("Vehicles")]);
        for entry in &self.series.fleet_status {
            table.add_row(vec![
                Cell::new(entry.status.label()),
                ui::count_cell(entry.count),
            ]);
        }
        table
    }

    fn recent_table(&self) -> comfy_table::Table {
        let c = self.kpis.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Booking"),
            ui::header_cell("Start"),
            ui::header_cell("Client"),
            ui::header_cell("Driver"),
            ui::header_cell("Status"),
            ui::header_cell(&format!("Paid ({c})")),
        ]);
        for booking in &self.recent_bookings {
            table.add_row(vec![
                Cell::new(&booking.id),
                ui::format_optional_cell(booking.start_date, |d| d.format("%Y-%m-%d").to_string()),
                ui::format_optional_cell(booking.client.as_deref(), str::to_string),
                ui::format_optional_cell(booking.driver.as_deref(), str::to_string),
                Cell::new(format!("{:?}", booking.status)),
                ui::amount_cell(booking.amount_paid, c),
            ]);
        }
        table
    }

    fn loss_table(&self) -> comfy_table::Table {
        let c = self.kpis.currency;
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Tour booking"),
            ui::header_cell(&format!("Profit ({c})")),
        ]);
        for tour in &self.tours_at_loss {
            table.add_row(vec![
                Cell::new(&tour.id),
                ui::signed_amount_cell(tour.profit, c),
            ]);
        }
        table
    }
}

/// Warnings and fallback rates for the cycle, empty when nothing degraded.
pub fn degradation_report(warnings: &[FetchWarning], degraded: &[Currency]) -> String {
    let mut output = String::new();
    for warning in warnings {
        output.push_str(&ui::style_text(
            &format!("! {} unavailable: {}\n", warning.collection, warning.message),
            ui::StyleType::Error,
        ));
    }
    if !degraded.is_empty() {
        let codes: Vec<&str> = degraded.iter().map(Currency::code).collect();
        output.push_str(&ui::style_text(
            &format!("Using fallback exchange rates for {}\n", codes.join(", ")),
            ui::StyleType::Subtle,
        ));
    }
    output
}

/// One refresh cycle, printed once.
pub async fn run(
    store: Arc<dyn RecordStore>,
    fallbacks: HashMap<Currency, f64>,
    filter: &FilterState,
) -> Result<()> {
    let pb = ui::new_spinner("Fetching records...");
    let aggregator = RecordAggregator::new(Arc::clone(&store));
    let converter = CurrencyConverter::new(store, fallbacks);
    let records = aggregator.fetch_all(filter).await;
    pb.set_message("Fetching exchange rates...");
    let rates = converter.get_rates().await;
    pb.finish_and_clear();

    if records.all_failed() {
        eprint!("{}", degradation_report(&records.warnings, rates.degraded()));
        bail!("Could not load any records from the store");
    }

    let metrics = calculate(&records, &rates, filter, Utc::now());
    info!(
        revenue = metrics.kpis.total_revenue,
        expenses = metrics.kpis.total_expenses,
        "Computed dashboard"
    );
    println!("{}", metrics.display_as_table(filter));
    print!("{}", degradation_report(&records.warnings, rates.degraded()));
    Ok(())
}
