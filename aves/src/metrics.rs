//! Prometheus metrics for the aves controller.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `aves_jobs_started_total` - Jobs whose workers were launched, by engine
//! - `aves_job_transitions_total` - Job status transitions
//! - `aves_reconcile_outcomes_total` - Processed watch events by outcome
//! - `aves_watch_reconnects_total` - Watch stream reconnects by source
//!
//! ## Gauges
//! - `aves_task_queue_depth` - Tasks waiting for a worker
//!
//! ## Histograms
//! - `aves_task_duration_seconds` - Control task duration
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for aves metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `engine`: The job's execution engine
pub static JOBS_STARTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("aves_jobs_started_total", "Total number of jobs launched");
    CounterVec::new(opts, &["engine"]).expect("aves_jobs_started_total metric creation failed")
});

/// Labels:
/// - `from`: Status before the transition
/// - `to`: Status after the transition
pub static JOB_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "aves_job_transitions_total",
        "Total number of job status transitions",
    );
    CounterVec::new(opts, &["from", "to"])
        .expect("aves_job_transitions_total metric creation failed")
});

/// Labels:
/// - `outcome`: applied, skipped, duplicate, dropped
pub static RECONCILE_OUTCOMES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "aves_reconcile_outcomes_total",
        "Total number of processed watch events",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("aves_reconcile_outcomes_total metric creation failed")
});

/// Labels:
/// - `source`: Watch source name
pub static WATCH_RECONNECTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "aves_watch_reconnects_total",
        "Total number of watch stream reconnects",
    );
    CounterVec::new(opts, &["source"])
        .expect("aves_watch_reconnects_total metric creation failed")
});

pub static TASK_QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("aves_task_queue_depth", "Tasks waiting for a worker")
        .expect("aves_task_queue_depth metric creation failed")
});

/// Labels:
/// - `task`: start_job, cancel_job, process_event
/// - `status`: success, retryable, failed
pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "aves_task_duration_seconds",
        "Control task duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["task", "status"])
        .expect("aves_task_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_STARTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOB_TRANSITIONS_TOTAL.clone()),
        Box::new(RECONCILE_OUTCOMES_TOTAL.clone()),
        Box::new(WATCH_RECONNECTS_TOTAL.clone()),
        Box::new(TASK_QUEUE_DEPTH.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_started(engine: &str) {
    JOBS_STARTED_TOTAL.with_label_values(&[engine]).inc();
}

pub fn record_job_transition(from: &str, to: &str) {
    JOB_TRANSITIONS_TOTAL.with_label_values(&[from, to]).inc();
}

pub fn record_reconcile_outcome(outcome: &str) {
    RECONCILE_OUTCOMES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_watch_reconnect(source: &str) {
    WATCH_RECONNECTS_TOTAL.with_label_values(&[source]).inc();
}

pub fn set_task_queue_depth(depth: f64) {
    TASK_QUEUE_DEPTH.set(depth);
}

pub fn observe_task_duration(task: &str, status: &str, duration_secs: f64) {
    TASK_DURATION_SECONDS
        .with_label_values(&[task, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
