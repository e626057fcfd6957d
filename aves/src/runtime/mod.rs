/// Runtime builder wiring a dispatcher to its queue and watch sources.
pub mod builder;
/// Task workers, watch loops, watchdog and shutdown.
pub mod supervisor;
/// Task worker settings.
pub mod worker;

pub use builder::ControllerRuntimeBuilder;
pub use supervisor::{ControllerRuntime, DispatchStatus, ShutdownToken, TaskDispatcher};
pub use worker::WorkerConfig;
