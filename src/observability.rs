use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: allocation attempts. Labels: outcome (ok, no_capacity).
pub const ALLOCATIONS_TOTAL: &str = "parkd_allocations_total";

/// Counter: reservations settled.
pub const SETTLEMENTS_TOTAL: &str = "parkd_settlements_total";

/// Counter: sum of settled costs, in cents.
pub const SETTLED_CENTS_TOTAL: &str = "parkd_settled_cents_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "parkd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "parkd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::InsertLot { .. } => "insert_lot",
        Command::ResizeLot { .. } => "resize_lot",
        Command::DeleteLot { .. } => "delete_lot",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::ReleaseReservation { .. } => "release_reservation",
        Command::SelectLots { .. } => "select_lots",
        Command::SelectSpots { .. } => "select_spots",
        Command::SelectReservations => "select_reservations",
        Command::SelectHistory => "select_history",
    }
}
