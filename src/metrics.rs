use std::sync::LazyLock;

use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/* ============================= LABEL VALUES ============================= */

pub const SKIP_NO_OBJECT_REF: &str = "no_object_ref";
pub const SKIP_NO_MATCHING_POLICY: &str = "no_matching_policy";

pub const ERROR_UNMARSHAL: &str = "unmarshal";
pub const ERROR_PUBLISH: &str = "publish";
pub const ERROR_EVALUATE: &str = "evaluate";

/* ============================= ENGINE METRICS ============================= */

pub static INPUTS_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_inputs_received_total",
            "Input records received from the bus",
        ),
        &["api_group", "resource"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static POLICIES_EVALUATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_policies_evaluated_total",
            "Policy evaluations by outcome",
        ),
        &["policy", "api_group", "kind", "matched"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static MESSAGES_SKIPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_messages_skipped_total",
            "Messages skipped before evaluation, by reason",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static MESSAGES_ERRORED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_messages_errored_total",
            "Message processing errors, by type",
        ),
        &["type"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ACTIVITIES_GENERATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activities_generated_total",
            "Activities published, per policy",
        ),
        &["policy"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static PROCESSING_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "activity_processing_duration_seconds",
            "Per-policy processing duration",
        ),
        &["policy"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static ACTIVE_POLICIES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("active_policies", "Policies currently admitted into the cache")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static ACTIVE_WORKERS: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("active_workers", "Worker tasks currently running")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= BUS METRICS ============================= */

pub static BUS_CONNECTED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("bus_connected", "Bus connection status (1=connected)")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static BUS_DISCONNECTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("bus_disconnects_total", "Bus disconnect events")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static BUS_RECONNECTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("bus_reconnects_total", "Bus reconnect events")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static BUS_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("bus_errors_total", "Bus client errors")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static MESSAGES_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("bus_messages_published_total", "Messages published to the bus")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static PUBLISH_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "bus_publish_latency_seconds",
        "Latency of acknowledged publishes",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/* ============================= HELPERS ============================= */

/// Force-init every metric so all series appear on /metrics from startup.
pub fn force_init() {
    LazyLock::force(&INPUTS_RECEIVED);
    LazyLock::force(&POLICIES_EVALUATED);
    LazyLock::force(&MESSAGES_SKIPPED);
    LazyLock::force(&MESSAGES_ERRORED);
    LazyLock::force(&ACTIVITIES_GENERATED);
    LazyLock::force(&PROCESSING_DURATION);
    LazyLock::force(&ACTIVE_POLICIES);
    LazyLock::force(&ACTIVE_WORKERS);
    LazyLock::force(&BUS_CONNECTED);
    LazyLock::force(&BUS_DISCONNECTS);
    LazyLock::force(&BUS_RECONNECTS);
    LazyLock::force(&BUS_ERRORS);
    LazyLock::force(&MESSAGES_PUBLISHED);
    LazyLock::force(&PUBLISH_LATENCY);
}

/// Encode the registry in the Prometheus text format.
pub fn encode() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        force_init();
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();

        for expected in [
            "activity_messages_skipped_total",
            "activity_messages_errored_total",
            "active_policies",
            "active_workers",
            "bus_connected",
            "bus_messages_published_total",
            "bus_publish_latency_seconds",
        ] {
            assert!(names.contains(&expected), "{expected} should be registered");
        }
    }

    #[test]
    fn test_skip_counter_labels() {
        force_init();
        MESSAGES_SKIPPED.with_label_values(&[SKIP_NO_OBJECT_REF]).inc();
        MESSAGES_SKIPPED.with_label_values(&[SKIP_NO_MATCHING_POLICY]).inc();
        let text = encode().expect("should encode");
        assert!(text.contains("no_object_ref"));
        assert!(text.contains("no_matching_policy"));
    }
}
