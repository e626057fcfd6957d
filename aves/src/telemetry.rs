//! Tracing spans and metric hooks for controller operations.
//!
//! Every helper logs through `tracing`; with the `metrics` feature the
//! `record_*` helpers also update the prometheus statics in
//! [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use aves::telemetry::{reconcile_span, record_reconcile_outcome};
//!
//! let span = reconcile_span(&event.fingerprint());
//! let _enter = span.enter();
//! record_reconcile_outcome(&event.fingerprint(), "applied");
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{info_span, Instrument, Span};

/// Span for launching a job's workers.
#[must_use]
pub fn start_span(job: impl AsRef<str>, engine: impl AsRef<str>) -> Span {
    info_span!(
        "aves.start",
        job = %job.as_ref(),
        engine = %engine.as_ref(),
    )
}

#[must_use]
pub fn cancel_span(job: impl AsRef<str>) -> Span {
    info_span!("aves.cancel", job = %job.as_ref())
}

/// Span for stopping a job's workers; `force` disables the debug exemption.
#[must_use]
pub fn clean_span(job: impl AsRef<str>, force: bool) -> Span {
    info_span!("aves.clean", job = %job.as_ref(), force)
}

/// Span for processing one watch event, keyed by its fingerprint.
#[must_use]
pub fn reconcile_span(fingerprint: impl AsRef<str>) -> Span {
    info_span!("aves.reconcile", fingerprint = %fingerprint.as_ref())
}

#[must_use]
pub fn watch_span(source: impl AsRef<str>) -> Span {
    info_span!("aves.watch", source = %source.as_ref())
}

#[must_use]
pub fn task_span(task: impl AsRef<str>, attempt: u32) -> Span {
    info_span!("aves.task", task = %task.as_ref(), attempt)
}

/// Attach a task span to a future.
pub fn instrument_task<F>(
    task: impl AsRef<str>,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(task_span(task, attempt))
}

pub fn record_job_started(job: impl AsRef<str>, engine: impl AsRef<str>, workers: usize) {
    tracing::info!(
        job = %job.as_ref(),
        engine = %engine.as_ref(),
        workers,
        "job started"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_started(engine.as_ref());
}

pub fn record_job_transition(job: impl AsRef<str>, from: impl AsRef<str>, to: impl AsRef<str>) {
    tracing::info!(
        job = %job.as_ref(),
        from = %from.as_ref(),
        to = %to.as_ref(),
        "job status changed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_transition(from.as_ref(), to.as_ref());
}

/// Record how a watch event ended: `applied`, `skipped`, `duplicate` or
/// `dropped`.
pub fn record_reconcile_outcome(fingerprint: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::debug!(
        fingerprint = %fingerprint.as_ref(),
        outcome = %outcome.as_ref(),
        "event processed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_reconcile_outcome(outcome.as_ref());
}

/// Record a watch stream reconnect after `failures` consecutive failures.
pub fn record_watch_reconnect(source: impl AsRef<str>, failures: u32, delay: Duration) {
    tracing::warn!(
        source = %source.as_ref(),
        consecutive_failures = failures,
        delay_ms = delay.as_millis() as u64,
        "watch stream reconnecting"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_watch_reconnect(source.as_ref());
}

pub fn set_task_queue_depth(depth: usize) {
    tracing::trace!(depth, "task queue depth");

    #[cfg(feature = "metrics")]
    crate::metrics::set_task_queue_depth(depth as f64);
}

pub fn record_task_start(task: impl AsRef<str>) -> TaskTimingHandle {
    TaskTimingHandle {
        task: task.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Close a timing handle; `status` is `success`, `retryable` or `failed`.
pub fn record_task_end(handle: TaskTimingHandle, status: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::debug!(
        task = %handle.task,
        status = %status.as_ref(),
        duration_secs,
        "task finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_task_duration(&handle.task, status.as_ref(), duration_secs);
}

/// Opaque handle from [`record_task_start`].
#[derive(Debug)]
pub struct TaskTimingHandle {
    task: String,
    start: std::time::Instant,
}

impl TaskTimingHandle {
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        assert_eq!(start_span("a-b-1", "horovod").metadata().unwrap().name(), "aves.start");
        assert_eq!(cancel_span("a-b-1").metadata().unwrap().name(), "aves.cancel");
        assert_eq!(clean_span("a-b-1", true).metadata().unwrap().name(), "aves.clean");
        assert_eq!(reconcile_span("p;Running;1;").metadata().unwrap().name(), "aves.reconcile");
        assert_eq!(watch_span("pods").metadata().unwrap().name(), "aves.watch");
        assert_eq!(task_span("start_job", 0).metadata().unwrap().name(), "aves.task");
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_task_start("cancel_job");
        assert_eq!(handle.task(), "cancel_job");

        std::thread::sleep(Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_task_end(handle, "success");
    }

    #[tokio::test]
    async fn test_instrument_task_passes_output_through() {
        let value = instrument_task("process_event", 1, async { 7 }).await;
        assert_eq!(value, 7);
    }
}
