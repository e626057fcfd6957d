//! Aves - job and worker reconciliation core for distributed training.
//!
//! Turns a training-job submission into orchestrator resources (one
//! workload, service and optional ingress per worker), keeps job and worker
//! status in step with the pods and cluster events the orchestrator reports,
//! and tears resources down when a job ends.
//!
//! # Core Concepts
//!
//! - **Job / Worker**: A [`Job`] is the aggregate root of one training run;
//!   its [`Worker`]s are materialized once from the role counts of the
//!   submission.
//!
//! - **Engine**: Each [`Engine`] decides the worker topology and the
//!   environment and commands that wire workers together.
//!
//! - **Controller**: The [`Controller`] runs the lifecycle operations
//!   (start, cancel, clean, status changes) under a per-job lock and applies
//!   watch events through the pure [`reconcile::plan`] mapping.
//!
//! - **Runtime**: The [`ControllerRuntime`] drives a dispatcher from a task
//!   queue, keeps watch streams open and runs the STARTING watchdog.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence via sqlx
//! - `metrics` - Prometheus metrics
//! - `kube` - Kubernetes orchestrator and watch sources
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use aves::*;
//!
//! let config = ControllerConfig::load()?;
//! let controller = Controller::builder(config)
//!     .with_store(Arc::new(InMemoryJobStore::new()))
//!     .with_orchestrator(orchestrator)
//!     .build()?;
//!
//! let job = controller.submit(submission).await?;
//! controller.start_job(job.id).await?;
//! ```

/// Node-affinity rules from scheduling strategies.
pub mod affinity;

/// Layered controller configuration.
///
/// [`ControllerConfig`] merges defaults, an optional TOML file named by
/// `AVES_CONFIG_PATH` and `AVES_`-prefixed environment variables.
pub mod config;

/// Job lifecycle operations.
pub mod controller;

/// Input/output data declarations and how they map into containers.
pub mod dataspec;

/// Training engines and manifest generation.
///
/// The `engine` module provides [`Engine`] with one strategy per supported
/// framework, and [`ManifestGenerator`] which renders a worker's resources.
pub mod engine;

/// Error types.
pub mod error;

/// Controller event publishing and subscription.
///
/// The `events` module provides:
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`ControllerEvent`] and [`ControllerEventPayload`] for event data
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Jobs, workers, statuses and worker planning.
pub mod job;

/// Event deduplication leases and retry backoff.
pub mod lease;

/// Orchestrator object builders and label selectors.
pub mod manifest;

/// Prometheus metrics (no-op without the `metrics` feature).
pub mod metrics;

/// Orchestrator client and watch capabilities.
pub mod orchestrator;

/// Control task queue.
///
/// The `queue` module defines [`ControlTask`], the [`TaskQueue`] trait and
/// the bounded [`InProcTaskQueue`].
pub mod queue;

/// Watch events and their mapping to status changes.
pub mod reconcile;

/// Status callbacks to the submitting service.
pub mod report;

/// Task workers, watch loops and the watchdog.
///
/// The `runtime` module provides:
/// - [`ControllerRuntime`] - main runtime type
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`TaskDispatcher`] - trait for executing control tasks
/// - [`WorkerConfig`] - individual task worker configuration
/// - [`ControllerRuntimeBuilder`] for constructing runtimes
pub mod runtime;

/// Job and worker status transitions and aggregation.
pub mod state;

/// Storage backends for job code, data and output.
pub mod storage;

/// Job records and per-job locks.
pub mod store;

/// Submission payloads and their validation.
pub mod submission;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed job records, event
/// leases and advisory-lock aggregate locks when the `postgres` feature is
/// enabled.
pub mod persistence;

#[cfg(feature = "kube")]
/// Kubernetes orchestrator and watch sources.
pub mod cluster;

pub use affinity::*;
pub use config::*;
pub use controller::*;
pub use dataspec::*;
pub use engine::{Engine, ManifestGenerator, Topology, WorkerManifests};
pub use error::{AvesError, OrchestratorError};
pub use events::*;
pub use job::*;
pub use lease::*;
pub use manifest::{LabelSelector, Manifest, ResourceKind};
pub use orchestrator::*;
pub use queue::*;
pub use reconcile::{
    ClusterEvent, EventSeverity, InvolvedObject, PodCondition, PodEvent, PodPhase, Reconciliation,
    WatchEvent, WatchEventType,
};
pub use report::*;
pub use runtime::*;
pub use state::{Aggregate, Trigger};
pub use storage::*;
pub use store::*;
pub use submission::*;
