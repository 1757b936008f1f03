//! Metrics
//!
//! Prometheus-compatible metrics for the exchange core: matching engine
//! throughput and latency, settlement totals, broadcast health, and
//! gateway connection counts.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency
pub mod names {
    // Matching engine
    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_RATE_LIMITED_TOTAL: &str = "orders_rate_limited_total";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const ORDER_MATCH_DURATION_SECONDS: &str = "order_match_duration_seconds";

    // Settlement
    pub const SETTLEMENTS_TOTAL: &str = "settlements_total";
    pub const SETTLEMENT_PAYOUT_DOLLARS: &str = "settlement_payout_dollars";

    // Invariants
    pub const INVARIANT_VIOLATIONS_TOTAL: &str = "invariant_violations_total";

    // Broadcast
    pub const BUS_REDIS_PUBLISHED_TOTAL: &str = "bus_redis_published_total";
    pub const BUS_REDIS_FAILURES_TOTAL: &str = "bus_redis_failures_total";

    // Gateway
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
}

/// Install the Prometheus recorder and return the render handle for the
/// `/metrics` endpoint.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        // matching is expected to sit in the sub-millisecond buckets
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_MATCH_DURATION_SECONDS.to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
        )
        .expect("histogram buckets are non-empty")
        .install_recorder()
        .expect("metrics recorder installs once at startup")
}
