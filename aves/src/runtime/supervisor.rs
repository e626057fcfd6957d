use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};

use crate::config::{RuntimeConfig, WatchdogConfig};
use crate::events::{ControllerEvent, EventSubscriber, InProcEventBus};
use crate::lease::{compute_backoff_delay, should_give_up};
use crate::orchestrator::WatchSource;
use crate::queue::{ControlTask, TaskEnvelope, TaskId, TaskQueue};
use crate::telemetry;

use super::worker::WorkerConfig;

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // registered before the flag check so a concurrent cancel is not missed
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes control tasks pulled from the queue.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: &ControlTask) -> DispatchStatus;

    /// Periodic maintenance run by the watchdog loop.
    async fn housekeep(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Result of dispatching one task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Success,
    /// Failed, but the same task may succeed later.
    RetryableFailure { error: Option<String> },
    PermanentFailure { error: Option<String> },
}

/// Task workers, watch loops and the watchdog around one dispatcher.
pub struct ControllerRuntime<D>
where
    D: TaskDispatcher + 'static,
{
    config: RuntimeConfig,
    watchdog: WatchdogConfig,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<D>,
    sources: Vec<Arc<dyn WatchSource>>,
    events: Arc<InProcEventBus>,
    shutdown_token: ShutdownToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<D> fmt::Debug for ControllerRuntime<D>
where
    D: TaskDispatcher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        let sources: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();

        f.debug_struct("ControllerRuntime")
            .field("config", &self.config)
            .field("watchdog", &self.watchdog)
            .field("dispatcher_type", &type_name::<D>())
            .field("sources", &sources)
            .field("queue_depth", &self.queue.depth())
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<D> ControllerRuntime<D>
where
    D: TaskDispatcher + 'static,
{
    pub fn new(
        config: RuntimeConfig,
        watchdog: WatchdogConfig,
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<D>,
        sources: Vec<Arc<dyn WatchSource>>,
        events: Arc<InProcEventBus>,
    ) -> Self {
        Self {
            config,
            watchdog,
            queue,
            dispatcher,
            sources,
            events,
            shutdown_token: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn dispatcher(&self) -> Arc<D> {
        Arc::clone(&self.dispatcher)
    }

    /// Bus the controller publishes to.
    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.events)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Queue a task for the worker pool.
    pub async fn submit(&self, task: ControlTask) -> anyhow::Result<TaskId> {
        let envelope = TaskEnvelope::new(task);
        let id = envelope.id;
        tracing::debug!(task = %envelope.task, %id, "task queued");
        self.queue.enqueue(envelope).await?;
        telemetry::set_task_queue_depth(self.queue.depth());
        Ok(id)
    }

    /// Spawn the task workers, one loop per watch source and the watchdog.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.spawn_task_workers(self.config.task_workers).await;
        for source in &self.sources {
            self.spawn_watch_loop(Arc::clone(source)).await;
        }
        self.spawn_watchdog().await;
        tracing::info!(
            workers = self.config.task_workers,
            sources = self.sources.len(),
            "controller runtime started"
        );
        Ok(())
    }

    /// Stop accepting work and wait for background tasks to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of controller runtime");

        self.shutdown_token.cancel();
        self.queue.close().await;

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let limit = Duration::from_secs(self.config.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Runtime task failed: {:?}", e),
                Err(_) => tracing::warn!("Runtime task timed out during shutdown"),
            }
        }

        tracing::info!("Controller runtime shutdown complete");
        Ok(())
    }

    pub async fn spawn_task_workers(&self, parallelism: usize) {
        let group = format!("aves-{}", std::process::id());
        for i in 0..parallelism {
            let worker = WorkerConfig::new(format!("{group}-w{i}"))
                .with_max_attempts(self.config.max_task_attempts)
                .with_retry(self.config.task_retry.clone());
            let queue = self.queue();
            let dispatcher = self.dispatcher();
            let shutdown = self.shutdown_token.clone();

            let handle = tokio::spawn(async move {
                Self::worker_loop(worker, queue, dispatcher, shutdown).await;
            });
            self.handles.lock().await.push(handle);
        }
    }

    pub async fn spawn_watch_loop(&self, source: Arc<dyn WatchSource>) {
        let queue = self.queue();
        let backoff = self.config.watch_backoff.clone();
        let shutdown = self.shutdown_token.clone();
        let span = telemetry::watch_span(source.name());

        let handle = tokio::spawn(tracing::Instrument::instrument(
            watch_loop(source, queue, backoff, shutdown),
            span,
        ));
        self.handles.lock().await.push(handle);
    }

    /// Periodically run the dispatcher's housekeeping.
    pub async fn spawn_watchdog(&self) {
        let dispatcher = self.dispatcher();
        let interval = Duration::from_secs(self.watchdog.interval_secs.max(1));
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Watchdog shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = dispatcher.housekeep().await {
                            tracing::warn!("watchdog housekeeping error: {err}");
                        }
                    }
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    async fn worker_loop(
        worker: WorkerConfig,
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<D>,
        shutdown: ShutdownToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker {} shutting down", worker.worker_id);
                    break;
                }
                next = queue.dequeue() => match next {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => {
                        tracing::info!("Worker {} found the queue closed", worker.worker_id);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("dequeue error: {err}");
                        tokio::time::sleep(Duration::from_millis(worker.idle_backoff_ms)).await;
                        continue;
                    }
                }
            };
            telemetry::set_task_queue_depth(queue.depth());

            let name = envelope.task.name();
            let timing = telemetry::record_task_start(name);
            let status = telemetry::instrument_task(
                name,
                envelope.attempts,
                dispatcher.dispatch(&envelope.task),
            )
            .await;

            match status {
                DispatchStatus::Success => telemetry::record_task_end(timing, "success"),
                DispatchStatus::RetryableFailure { error } => {
                    let attempts = envelope.attempts.saturating_add(1);
                    if should_give_up(attempts, worker.max_attempts) {
                        tracing::error!(
                            task = %envelope.task,
                            attempts,
                            error = error.as_deref().unwrap_or(""),
                            "task dropped after retries"
                        );
                        telemetry::record_task_end(timing, "failed");
                        continue;
                    }
                    let delay = compute_backoff_delay(attempts, &worker.retry);
                    tracing::warn!(
                        task = %envelope.task,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = error.as_deref().unwrap_or(""),
                        "task failed, retrying"
                    );
                    telemetry::record_task_end(timing, "retryable");
                    requeue_later(Arc::clone(&queue), envelope.retried(), delay, shutdown.clone());
                }
                DispatchStatus::PermanentFailure { error } => {
                    tracing::warn!(
                        task = %envelope.task,
                        error = error.as_deref().unwrap_or(""),
                        "task failed"
                    );
                    telemetry::record_task_end(timing, "failed");
                }
            }
        }
    }
}

fn requeue_later(
    queue: Arc<dyn TaskQueue>,
    envelope: TaskEnvelope,
    delay: Duration,
    shutdown: ShutdownToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(task = %envelope.task, "retry abandoned at shutdown");
            }
            _ = tokio::time::sleep(delay) => {
                if let Err(err) = queue.enqueue(envelope).await {
                    tracing::warn!("task requeue failed: {err}");
                }
            }
        }
    });
}

/// Forward actionable events from one source to the task queue, reopening
/// the stream with exponential backoff whenever it fails or ends.
async fn watch_loop(
    source: Arc<dyn WatchSource>,
    queue: Arc<dyn TaskQueue>,
    backoff: crate::config::BackoffConfig,
    shutdown: ShutdownToken,
) {
    let mut failures: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match source.open().await {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            failures = 0;
                            if !event.is_actionable() {
                                continue;
                            }
                            let task = ControlTask::ProcessEvent { event };
                            if let Err(err) = queue.enqueue(TaskEnvelope::new(task)).await {
                                tracing::warn!("event not queued: {err}");
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(source = source.name(), "watch stream error: {err}");
                            break;
                        }
                        None => {
                            tracing::debug!(source = source.name(), "watch stream ended");
                            break;
                        }
                    }
                }
            },
            Err(err) => tracing::warn!(source = source.name(), "watch open failed: {err}"),
        }

        failures = failures.saturating_add(1);
        let delay = compute_backoff_delay(failures, &backoff);
        telemetry::record_watch_reconnect(source.name(), failures, delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!(source = source.name(), "Watch loop shutting down");
}
