use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rentd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rentd_query_duration_seconds";

// ── Rental outcomes ─────────────────────────────────────────────

/// Counter: rentals created.
pub const RENTALS_CREATED_TOTAL: &str = "rentd_rentals_created_total";

/// Counter: rental requests refused by the capacity gate. Labels: reason.
pub const RENTALS_REJECTED_TOTAL: &str = "rentd_rentals_rejected_total";

/// Counter: rentals leaving the active state. Labels: outcome (ended, confirmed).
pub const RENTALS_TERMINATED_TOTAL: &str = "rentd_rentals_terminated_total";

/// Counter: cached stock counter disagreed with the rental ledger. Labels: kind (underflow, clamp).
pub const STOCK_COUNTER_DRIFT_TOTAL: &str = "rentd_stock_counter_drift_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "rentd_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "rentd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "rentd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertItem { .. } => "insert_item",
        Command::UpdateItem { .. } => "update_item",
        Command::DeleteItem { .. } => "delete_item",
        Command::SelectItems { .. } => "select_items",
        Command::SelectItem { .. } => "select_item",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertRental { .. } => "insert_rental",
        Command::EndRental { .. } => "end_rental",
        Command::ConfirmRental { .. } => "confirm_rental",
        Command::SelectRental { .. } => "select_rental",
        Command::SelectActiveRentals => "select_rentals",
    }
}
