use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Booking activity ────────────────────────────────────────────

/// Counter: bookings written. Labels: op (create, update).
pub const BOOKINGS_SAVED_TOTAL: &str = "innkeep_bookings_saved_total";

/// Counter: bookings deleted.
pub const BOOKINGS_DELETED_TOTAL: &str = "innkeep_bookings_deleted_total";

/// Counter: rejected mutations. Labels: op, reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "innkeep_booking_rejections_total";

/// Counter: owner blocks written. Labels: op (add, remove).
pub const BLOCKS_TOTAL: &str = "innkeep_blocks_total";

// ── Transport and resources ─────────────────────────────────────

/// Counter: requests served. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "innkeep_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "innkeep_request_duration_seconds";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Gauge: properties with a loaded engine.
pub const PROPERTIES_ACTIVE: &str = "innkeep_properties_active";

// ── Ledger ──────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const LEDGER_FLUSH_DURATION_SECONDS: &str = "innkeep_ledger_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const LEDGER_FLUSH_BATCH_SIZE: &str = "innkeep_ledger_flush_batch_size";

/// Counter: completed compactions.
pub const COMPACTIONS_TOTAL: &str = "innkeep_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count a rejected mutation under its error label.
pub fn record_rejection(op: &'static str, err: &EngineError) {
    metrics::counter!(BOOKING_REJECTIONS_TOTAL, "op" => op, "reason" => err.label()).increment(1);
}
