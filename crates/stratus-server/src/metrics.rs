//! Prometheus metrics for the daemon control plane.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};

/// Total queries accepted by this coordinator
pub static NUM_QUERIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("stratus_queries_total", "Total queries accepted by this node").unwrap()
});

/// Total plan-fragment instances executed by this node
pub static NUM_FRAGMENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stratus_fragments_total",
        "Total plan-fragment instances executed by this node"
    )
    .unwrap()
});

/// Currently open legacy-protocol sessions
pub static NUM_OPEN_LEGACY_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "stratus_open_legacy_sessions",
        "Currently open legacy-protocol sessions"
    )
    .unwrap()
});

/// Currently open HS2-protocol sessions
pub static NUM_OPEN_HS2_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_open_hs2_sessions", "Currently open HS2-protocol sessions")
        .unwrap()
});

/// Sessions expired by the idle-session timer
pub static NUM_SESSIONS_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stratus_sessions_expired_total",
        "Sessions expired due to inactivity"
    )
    .unwrap()
});

/// Queries expired by the idle-query timer
pub static NUM_QUERIES_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stratus_queries_expired_total",
        "Queries expired due to client inactivity"
    )
    .unwrap()
});

/// 1 when the local catalog replica has caught up with the catalog service
pub static CATALOG_READY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_catalog_ready", "Whether the local catalog replica is usable")
        .unwrap()
});

/// Locally observed catalog version
pub static CATALOG_VERSION: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_catalog_version", "Locally observed catalog version").unwrap()
});

/// Databases visible in the local catalog replica
pub static CATALOG_NUM_DBS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_catalog_num_databases", "Databases in the local catalog").unwrap()
});

/// Tables visible in the local catalog replica
pub static CATALOG_NUM_TABLES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_catalog_num_tables", "Tables in the local catalog").unwrap()
});

/// Live backends known from the membership topic
pub static NUM_KNOWN_BACKENDS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_known_backends", "Live backends in the membership view").unwrap()
});

/// Work items waiting in the cancellation pool
pub static CANCELLATION_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "stratus_cancellation_queue_depth",
        "Work items waiting in the cancellation pool"
    )
    .unwrap()
});

/// 1 while the daemon accepts new queries, 0 while offline
pub static SERVER_ONLINE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_server_online", "Whether the daemon accepts new queries").unwrap()
});

/// Force registration of every metric so scrapes see zeros before first use.
pub fn init_metrics() {
    NUM_QUERIES.get();
    NUM_FRAGMENTS.get();
    NUM_OPEN_LEGACY_SESSIONS.get();
    NUM_OPEN_HS2_SESSIONS.get();
    NUM_SESSIONS_EXPIRED.get();
    NUM_QUERIES_EXPIRED.get();
    CATALOG_READY.get();
    CATALOG_VERSION.get();
    CATALOG_NUM_DBS.get();
    CATALOG_NUM_TABLES.get();
    NUM_KNOWN_BACKENDS.get();
    CANCELLATION_QUEUE_DEPTH.get();
    SERVER_ONLINE.set(1);
}

/// Render the default registry in the text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        init_metrics();
        NUM_QUERIES.inc();
        let text = gather();
        assert!(text.contains("stratus_queries_total"));
        assert!(text.contains("stratus_server_online"));
    }
}
