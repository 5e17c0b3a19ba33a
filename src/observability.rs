use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "slotwise_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "slotwise_op_duration_seconds";

/// Counter: bookings committed (create + reschedule replacements).
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Counter: booking attempts that lost the slot race.
pub const SLOT_CONFLICTS_TOTAL: &str = "slotwise_slot_conflicts_total";

/// Counter: mutating requests answered from the idempotency cache.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "slotwise_idempotent_replays_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "slotwise_auth_failures_total";

/// Gauge: number of onboarded fixers.
pub const FIXERS_ACTIVE: &str = "slotwise_fixers_active";

/// Counter: reads that degraded to Unknown/Disabled on lock timeout.
/// Labels: query.
pub const DEGRADED_READS_TOTAL: &str = "slotwise_degraded_reads_total";

/// Counter: resolver/aggregator cache lookups. Labels: kind.
pub const CACHE_HITS_TOTAL: &str = "slotwise_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "slotwise_cache_misses_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::SetAvailability { .. } => "set_availability",
        Request::GetAvailability { .. } => "get_availability",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::Complete { .. } => "complete",
        Request::Reschedule { .. } => "reschedule",
        Request::ResolveSlot { .. } => "resolve_slot",
        Request::AggregateMonth { .. } => "aggregate_month",
        Request::Appointments { .. } => "appointments",
        Request::BookedCounts { .. } => "booked_counts",
        Request::Watch { .. } => "watch",
        Request::Unwatch { .. } => "unwatch",
    }
}
