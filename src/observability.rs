use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotledger_query_duration_seconds";

// ── Domain counters ─────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotledger_bookings_created_total";

/// Counter: writes rejected because they overlapped an existing booking.
pub const CONFLICTS_TOTAL: &str = "slotledger_conflicts_total";

/// Counter: bookings folded into the monthly effort rollup.
pub const ROLLUPS_APPLIED_TOTAL: &str = "slotledger_rollups_applied_total";

/// Counter: rollups skipped after a failure. The booking itself still stands.
pub const ROLLUP_FAILURES_TOTAL: &str = "slotledger_rollup_failures_total";

/// Counter: directory or catalog lookups that ran out of attempts. Labels: lookup.
pub const LOOKUP_FAILURES_TOTAL: &str = "slotledger_lookup_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotledger_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotledger_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::BulkInsertBookings { .. } => "bulk_insert_bookings",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectConflict { .. } => "select_conflict",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectEffort { .. } => "select_effort",
        Command::SelectEffortTotals { .. } => "select_effort_totals",
        Command::SelectEffortDistribution { .. } => "select_effort_distribution",
        Command::SelectActiveSubjects { .. } => "select_active_subjects",
        Command::SelectEffortReport { .. } => "select_effort_report",
    }
}
