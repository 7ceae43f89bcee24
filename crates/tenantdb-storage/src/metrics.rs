//! Prometheus metrics for tenant routing and transaction coordination.
//!
//! Enabled with the `metrics` feature.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    /// Tenant metadata cache lookups by outcome (hit, miss)
    pub static ref TENANT_CACHE_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tenantdb_tenant_cache_lookups_total",
        "Tenant metadata cache lookups by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");

    /// Coordinated transactions by outcome (committed, rolled_back, partial_commit, no_op)
    pub static ref TRANSACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tenantdb_transactions_total",
        "Coordinated transactions by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");

    pub static ref ROLLBACK_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "tenantdb_rollback_failures_total",
        "Unit-of-work rollbacks that failed during rollback-all"
    )
    .expect("metric can be registered");
}

pub fn record_cache_lookup(outcome: &str) {
    TENANT_CACHE_LOOKUPS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_transaction(outcome: &str) {
    TRANSACTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_rollback_failure() {
    ROLLBACK_FAILURES_TOTAL.inc();
}

/// Render all registered metrics in the Prometheus text format.
pub fn encode() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        record_cache_lookup("hit");
        record_transaction("committed");
        record_rollback_failure();

        let text = encode();
        assert!(text.contains("tenantdb_tenant_cache_lookups_total"));
        assert!(text.contains("tenantdb_transactions_total"));
        assert!(text.contains("tenantdb_rollback_failures_total"));
    }
}
