//! Process-wide Prometheus registry: one struct of counters/histograms built
//! once at startup and handed around by reference.

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
};

pub struct Metrics {
    pub registry: Registry,
    pub admission_total: IntCounterVec,
    pub credential_calls_total: IntCounterVec,
    pub ban_events_total: IntCounterVec,
    pub upstream_attempts: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let admission_total = register_int_counter_vec_with_registry!(
            "gateway_admission_total",
            "Admission decisions by outcome",
            &["outcome"],
            registry
        )
        .expect("register admission_total");
        let credential_calls_total = register_int_counter_vec_with_registry!(
            "gateway_credential_calls_total",
            "Per-credential call outcomes",
            &["credential_id", "outcome"],
            registry
        )
        .expect("register credential_calls_total");
        let ban_events_total = register_int_counter_vec_with_registry!(
            "gateway_ban_events_total",
            "Ban/auto-unban/prune events",
            &["event"],
            registry
        )
        .expect("register ban_events_total");
        let upstream_attempts = register_histogram_vec_with_registry!(
            "gateway_upstream_attempt_seconds",
            "Latency of individual upstream attempts by outcome",
            &["outcome"],
            registry
        )
        .expect("register upstream_attempts");

        Self {
            registry,
            admission_total,
            credential_calls_total,
            ban_events_total,
            upstream_attempts,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buf)
            .expect("encode metrics");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
