// Prometheus metrics for the faultline controller
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Query polling activity and failures (counters)
// - Active pollers and subscriptions (gauges)
// - Experiments started and verdicts reached (counters)
// - Active experiment monitors (gauge)

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Query polling metrics
    pub static ref QUERY_POLLS_TOTAL: IntCounter = IntCounter::new(
        "faultline_query_polls_total",
        "Total number of metric queries executed by pollers"
    ).expect("Failed to create query polls metric");

    pub static ref QUERY_POLL_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "faultline_query_poll_errors_total",
        "Total number of failed or non-scalar metric queries"
    ).expect("Failed to create query poll errors metric");

    pub static ref ACTIVE_POLLERS: IntGauge = IntGauge::new(
        "faultline_active_pollers",
        "Number of distinct queries currently being polled"
    ).expect("Failed to create active pollers metric");

    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge = IntGauge::new(
        "faultline_active_subscriptions",
        "Number of open query subscriptions"
    ).expect("Failed to create active subscriptions metric");

    // Experiment lifecycle metrics
    pub static ref EXPERIMENTS_STARTED_TOTAL: IntCounter = IntCounter::new(
        "faultline_experiments_started_total",
        "Total number of experiments moved from Pending to Started"
    ).expect("Failed to create experiments started metric");

    pub static ref EXPERIMENT_VERDICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("faultline_experiment_verdicts_total", "Total number of experiment verdicts recorded"),
        &["state"]
    ).expect("Failed to create experiment verdicts metric");

    pub static ref ACTIVE_MONITORS: IntGauge = IntGauge::new(
        "faultline_active_monitors",
        "Number of experiments currently being monitored"
    ).expect("Failed to create active monitors metric");

    pub static ref REPORT_WRITE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "faultline_report_write_errors_total",
        "Total number of experiment reports that could not be persisted"
    ).expect("Failed to create report write errors metric");
}

/// Initialize metrics registry - must be called once at controller startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(QUERY_POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUERY_POLL_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_POLLERS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SUBSCRIPTIONS.clone()))?;
    REGISTRY.register(Box::new(EXPERIMENTS_STARTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EXPERIMENT_VERDICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_MONITORS.clone()))?;
    REGISTRY.register(Box::new(REPORT_WRITE_ERRORS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
