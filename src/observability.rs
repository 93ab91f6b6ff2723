use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetbay_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetbay_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: status transitions recorded. Labels: entity, to.
pub const TRANSITIONS_TOTAL: &str = "fleetbay_transitions_total";

/// Counter: pending requests rejected by the expiry sweep.
pub const REQUESTS_EXPIRED_TOTAL: &str = "fleetbay_requests_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetbay_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetbay_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetbay_connections_rejected_total";

/// Gauge: number of open workshops (loaded engines).
pub const TENANTS_ACTIVE: &str = "fleetbay_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "fleetbay_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbay_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbay_wal_flush_batch_size";

/// Gauge: records appended to a workshop's WAL since it was opened.
pub const WAL_RECORDS: &str = "fleetbay_wal_records";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::InsertRequest(_) => "insert_request",
        Command::InsertConfirmation { .. } => "insert_confirmation",
        Command::InsertRejection { .. } => "insert_rejection",
        Command::InsertWorkOrder { .. } => "insert_work_order",
        Command::InsertAdvance { .. } => "insert_advance",
        Command::InsertClosure { .. } => "insert_closure",
        Command::InsertOverride { .. } => "insert_override",
        Command::SelectAvailableBlocks { .. } => "select_available_blocks",
        Command::SelectAvailableDates => "select_available_dates",
        Command::SelectTimeline { .. } => "select_timeline",
        Command::SelectRequest { .. } => "select_request",
        Command::SelectWorkOrder { .. } => "select_work_order",
        Command::SelectPendingRequests => "select_pending_requests",
        Command::SelectTransitions { .. } => "select_transitions",
        Command::SelectVehicles => "select_vehicles",
    }
}
