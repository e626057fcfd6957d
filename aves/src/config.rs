use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::AvesError;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "AVES_CONFIG_PATH";

/// Top-level controller configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub runtime: RuntimeConfig,
    pub manifest: ManifestConfig,
    pub report: ReportConfig,
    pub watchdog: WatchdogConfig,
}

impl ControllerConfig {
    /// Defaults, then the TOML file named by `AVES_CONFIG_PATH`, then
    /// `AVES_`-prefixed environment variables (`__` separates nested keys).
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(ControllerConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("AVES_").ignore(&["CONFIG_PATH"]).split("__"))
    }

    pub fn load() -> Result<Self, AvesError> {
        Self::figment().extract().map_err(|err| AvesError::Config(Box::new(err)))
    }
}

/// Exponential backoff bounds: `min(base * 2^(attempt-1), max)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

/// Task workers, retries and watch reconnection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of concurrent task workers.
    pub task_workers: usize,
    /// Bounded capacity of the in-process task queue.
    pub task_queue_capacity: usize,
    /// Attempts per task before it is dropped.
    pub max_task_attempts: u32,
    /// Backoff between retries of a failed task.
    pub task_retry: BackoffConfig,
    /// Backoff between watch stream reconnects.
    pub watch_backoff: BackoffConfig,
    /// How long a processed event fingerprint suppresses redelivery.
    pub event_lease_ttl_secs: u64,
    /// Time allowed for background tasks to stop on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_workers: 4,
            task_queue_capacity: 1024,
            max_task_attempts: 3,
            task_retry: BackoffConfig {
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
            },
            watch_backoff: BackoffConfig::default(),
            event_lease_ttl_secs: 300,
            shutdown_timeout_secs: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn event_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.event_lease_ttl_secs)
    }
}

/// Per-worker resources applied when a role leaves them out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub cpu: Option<u32>,
    pub memory: Option<String>,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cpu: Some(4),
            memory: Some("8Gi".to_string()),
        }
    }
}

/// Knobs used while rendering orchestrator manifests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub resources: ResourceDefaults,
    /// Extended resource name for GPUs.
    pub gpu_resource: String,
    /// Image for init containers that wait on peers.
    pub wait_image: String,
    /// Seconds between peer reachability probes.
    pub peer_wait_interval_secs: u64,
    /// Probes before the wait gives up and fails the pod.
    pub peer_wait_max_attempts: u32,
    /// In-container directory receiving run logs.
    pub runlog_dir: String,
    /// Node-local root for per-worker workspaces in object-file mode.
    pub node_local_dir: String,
    /// Download location of the run wrapper used in object-file mode.
    pub wrapper_url: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            resources: ResourceDefaults::default(),
            gpu_resource: "nvidia.com/gpu".to_string(),
            wait_image: "busybox:latest".to_string(),
            peer_wait_interval_secs: 10,
            peer_wait_max_attempts: 360,
            runlog_dir: "/AVES/log".to_string(),
            node_local_dir: "/mnt/aves/local".to_string(),
            wrapper_url: "http://aves-api/static/aves_run_wrapper.sh".to_string(),
        }
    }
}

/// External status-report endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Reporting is disabled when unset.
    pub endpoint: Option<String>,
    pub max_attempts: u32,
    pub retry_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: 3,
            retry_interval_secs: 10,
            timeout_secs: 10,
        }
    }
}

/// Scan for jobs stuck in STARTING.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_secs: u64,
    pub starting_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            starting_timeout_secs: 300,
        }
    }
}
