use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::{ControllerConfig, RuntimeConfig, WatchdogConfig};
use crate::events::InProcEventBus;
use crate::orchestrator::WatchSource;
use crate::queue::{InProcTaskQueue, TaskQueue};

use super::supervisor::{ControllerRuntime, TaskDispatcher};

/// Builder for constructing a `ControllerRuntime` with explicit dependencies.
///
/// The dispatcher is required. The queue defaults to an [`InProcTaskQueue`]
/// sized from the runtime config and the event bus to a fresh
/// [`InProcEventBus`].
///
/// # Example
///
/// ```ignore
/// use aves::*;
///
/// let events = Arc::new(InProcEventBus::default());
/// let controller = Arc::new(
///     Controller::builder(config.clone())
///         .with_store(store)
///         .with_orchestrator(orchestrator)
///         .with_events(events.clone())
///         .build()?,
/// );
/// let runtime = ControllerRuntimeBuilder::from_config(&config)
///     .with_dispatcher(controller)
///     .with_events(events)
///     .with_watch_source(pods)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct ControllerRuntimeBuilder<D>
where
    D: TaskDispatcher + 'static,
{
    config: RuntimeConfig,
    watchdog: WatchdogConfig,
    queue: Option<Arc<dyn TaskQueue>>,
    dispatcher: Option<Arc<D>>,
    sources: Vec<Arc<dyn WatchSource>>,
    events: Option<Arc<InProcEventBus>>,
}

impl<D> fmt::Debug for ControllerRuntimeBuilder<D>
where
    D: TaskDispatcher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ControllerRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("watchdog", &self.watchdog);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("dispatcher_set", &self.dispatcher.is_some());
        debug.field("sources", &self.sources.len());
        debug.field("events_set", &self.events.is_some());

        if self.dispatcher.is_some() {
            debug.field("dispatcher_type", &type_name::<D>());
        }

        debug.finish()
    }
}

impl<D> ControllerRuntimeBuilder<D>
where
    D: TaskDispatcher + 'static,
{
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            watchdog: WatchdogConfig::default(),
            queue: None,
            dispatcher: None,
            sources: Vec::new(),
            events: None,
        }
    }

    /// Runtime and watchdog sections of a controller config.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.runtime.clone()).with_watchdog(config.watchdog.clone())
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<D>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Add a watch source; each gets its own loop.
    pub fn with_watch_source(mut self, source: Arc<dyn WatchSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the dispatcher is missing.
    pub fn build(self) -> anyhow::Result<ControllerRuntime<D>> {
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher dependency missing"))?;
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InProcTaskQueue::new(self.config.task_queue_capacity)));
        let events = self.events.unwrap_or_default();

        Ok(ControllerRuntime::new(
            self.config,
            self.watchdog,
            queue,
            dispatcher,
            self.sources,
            events,
        ))
    }
}
