//! Execution engines and the manifest generator that composes them with a
//! storage strategy.
//!
//! Engines form a closed set resolved at submission time. Each engine module
//! exposes `plan`, which decides a worker's topology, command, environment
//! and init steps, and `host_envs`, the peer host lists it publishes.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ManifestConfig;
use crate::dataspec::JobData;
use crate::error::AvesError;
use crate::job::{DistributeType, Job, RoleSpec, Worker};
use crate::manifest;

mod caffe;
mod generator;
mod generic;
mod horovod;
mod mxnet;
mod pytorch;
mod sge;
mod tensorflow;

pub use generator::{ManifestGenerator, WorkerManifests};

pub(crate) const SSH_PORT: u16 = 22;
pub(crate) const DEFAULT_PORT: u16 = 2222;
pub(crate) const SSH_DAEMON: &str = "/usr/sbin/sshd -D";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "TensorFlow", alias = "tensorflow")]
    TensorFlow,
    #[serde(rename = "PyTorch", alias = "pytorch")]
    PyTorch,
    #[serde(rename = "Horovod", alias = "horovod")]
    Horovod,
    #[serde(rename = "Mxnet", alias = "mxnet")]
    Mxnet,
    #[serde(rename = "Caffe", alias = "caffe")]
    Caffe,
    #[serde(rename = "CaffeMpi", alias = "caffempi")]
    CaffeMpi,
    #[serde(rename = "SGE", alias = "sge")]
    Sge,
    #[serde(rename = "XGBoost", alias = "xgboost")]
    XGBoost,
    #[serde(rename = "Custom", alias = "custom")]
    Custom,
}

impl Engine {
    pub const ALL: [Engine; 9] = [
        Engine::TensorFlow,
        Engine::PyTorch,
        Engine::Horovod,
        Engine::Mxnet,
        Engine::Caffe,
        Engine::CaffeMpi,
        Engine::Sge,
        Engine::XGBoost,
        Engine::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::TensorFlow => "TensorFlow",
            Engine::PyTorch => "PyTorch",
            Engine::Horovod => "Horovod",
            Engine::Mxnet => "Mxnet",
            Engine::Caffe => "Caffe",
            Engine::CaffeMpi => "CaffeMpi",
            Engine::Sge => "SGE",
            Engine::XGBoost => "XGBoost",
            Engine::Custom => "Custom",
        }
    }

    /// Roles the engine understands; `None` accepts any role name.
    fn allowed_roles(&self) -> Option<&'static [&'static str]> {
        match self {
            Engine::TensorFlow => Some(&["ps", "worker"]),
            Engine::PyTorch | Engine::Caffe | Engine::CaffeMpi | Engine::XGBoost => Some(&["worker"]),
            Engine::Horovod | Engine::Mxnet => Some(&["master", "worker"]),
            Engine::Sge => Some(&["master", "exec"]),
            Engine::Custom => None,
        }
    }

    fn required_role(&self) -> Option<&'static str> {
        match self {
            Engine::TensorFlow
            | Engine::PyTorch
            | Engine::Caffe
            | Engine::CaffeMpi
            | Engine::XGBoost => Some("worker"),
            Engine::Horovod | Engine::Mxnet | Engine::Sge => Some("master"),
            Engine::Custom => None,
        }
    }

    /// Check the role layout of a submission against the engine.
    pub fn validate_roles(
        &self,
        roles: &BTreeMap<String, RoleSpec>,
        has_outputs: bool,
    ) -> Result<(), AvesError> {
        if roles.is_empty() {
            return Err(AvesError::validation("resourceSpec declares no roles"));
        }
        if let Some(allowed) = self.allowed_roles() {
            if let Some(unknown) = roles.keys().find(|role| !allowed.contains(&role.as_str())) {
                return Err(AvesError::validation(format!(
                    "engine {self} does not support role {unknown:?} (expected one of {})",
                    allowed.join(", ")
                )));
            }
        }
        if let Some(required) = self.required_role() {
            if !roles.contains_key(required) {
                return Err(AvesError::validation(format!(
                    "engine {self} requires a {required:?} role"
                )));
            }
        }
        if *self == Engine::Caffe {
            if !has_outputs {
                return Err(AvesError::validation("outputSpec is not defined"));
            }
            if roles.get("worker").is_some_and(|spec| spec.count > 1) {
                return Err(AvesError::validation("engine Caffe runs a single worker"));
            }
        }
        Ok(())
    }

    /// Topology tag derived from the declared roles.
    pub fn distribute_type(&self, roles: &BTreeMap<String, RoleSpec>) -> DistributeType {
        let count = |role: &str| roles.get(role).map(|spec| spec.count).unwrap_or(0);
        match self {
            Engine::TensorFlow if roles.contains_key("ps") => DistributeType::ParameterServer,
            Engine::Horovod => DistributeType::AllReduce,
            Engine::PyTorch if count("worker") > 1 => DistributeType::AllReduce,
            Engine::Mxnet if count("worker") > 0 => DistributeType::SshRing,
            Engine::CaffeMpi if count("worker") > 1 => DistributeType::SshRing,
            Engine::Sge if count("exec") > 0 => DistributeType::SshRing,
            _ => DistributeType::None,
        }
    }

    /// Ports for a worker: daemon ports are always present; other engines
    /// fall back to their default only when nothing was declared.
    pub fn resolve_ports(&self, declared: Option<u16>) -> Vec<u16> {
        let mut ports: Vec<u16> = declared.into_iter().collect();
        match self {
            Engine::Horovod | Engine::Mxnet | Engine::CaffeMpi => {
                if !ports.contains(&SSH_PORT) {
                    ports.push(SSH_PORT);
                }
            }
            Engine::Custom => {}
            _ => {
                if ports.is_empty() {
                    ports.push(DEFAULT_PORT);
                }
            }
        }
        ports
    }

    pub(crate) fn plan(&self, ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
        match self {
            Engine::TensorFlow => tensorflow::plan(ctx),
            Engine::PyTorch => pytorch::plan(ctx),
            Engine::Horovod => horovod::plan(ctx),
            Engine::Mxnet => mxnet::plan(ctx),
            Engine::Caffe => caffe::plan_single(ctx),
            Engine::CaffeMpi => caffe::plan_mpi(ctx),
            Engine::Sge => sge::plan(ctx),
            Engine::XGBoost | Engine::Custom => generic::plan(ctx),
        }
    }

    /// Peer host-list variables published for a distributed job.
    pub fn host_envs(&self, job: &Job, workers: &[Worker]) -> BTreeMap<String, String> {
        if !job.is_distribute() {
            return BTreeMap::new();
        }
        match self {
            Engine::TensorFlow => tensorflow::host_envs(job, workers),
            Engine::Horovod | Engine::Mxnet => horovod::host_envs(job, workers),
            Engine::CaffeMpi => caffe::host_envs(job, workers),
            Engine::Sge => sge::host_envs(job, workers),
            Engine::PyTorch => pytorch::host_envs(job, workers),
            Engine::Caffe | Engine::XGBoost | Engine::Custom => BTreeMap::new(),
        }
    }
}

impl Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = AvesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Engine::ALL
            .into_iter()
            .find(|engine| engine.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AvesError::validation(format!("unknown engine {s:?}")))
    }
}

/// How a worker participates in the job.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Topology {
    /// Runs the user entrypoint and launches work on peers.
    Coordinator,
    /// Runs the user entrypoint alongside other peers.
    #[default]
    Peer,
    /// Hosts a daemon and waits for a coordinator.
    Standby,
}

impl Topology {
    /// Standby daemons never exit on their own.
    pub fn runs_user_code(&self) -> bool {
        !matches!(self, Topology::Standby)
    }
}

/// Inputs available while rendering one worker.
#[derive(Clone, Copy, Debug)]
pub struct RenderContext<'a> {
    pub job: &'a Job,
    pub worker: &'a Worker,
    /// Every worker of the job, including `worker`.
    pub workers: &'a [Worker],
    pub data: &'a JobData,
    /// Data arguments chosen by the storage strategy.
    pub data_args: &'a str,
    pub config: &'a ManifestConfig,
}

impl RenderContext<'_> {
    pub fn namespace(&self) -> &str {
        self.job.namespace()
    }

    /// Entrypoint followed by the declared arguments.
    pub fn user_command(&self) -> String {
        let mut command = self.worker.entry_point.trim().to_string();
        for arg in &self.worker.args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    pub fn role_size(&self, role: &str) -> usize {
        role_workers(self.workers, role).len()
    }
}

/// Engine decisions for one worker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerPlan {
    pub topology: Topology,
    /// User command for runners, daemon command for standby workers.
    pub command: String,
    pub envs: Vec<(String, String)>,
    pub init_containers: Vec<Value>,
    pub volumes: Vec<Value>,
    pub volume_mounts: Vec<Value>,
}

impl WorkerPlan {
    pub(crate) fn runner(topology: Topology, command: String) -> Self {
        Self {
            topology,
            command,
            ..Default::default()
        }
    }

    pub(crate) fn standby(daemon: &str) -> Self {
        Self {
            topology: Topology::Standby,
            command: daemon.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn with_envs(mut self, envs: BTreeMap<String, String>) -> Self {
        self.envs.extend(envs);
        self
    }
}

/// Workers of one role ordered by index.
pub(crate) fn role_workers<'a>(workers: &'a [Worker], role: &str) -> Vec<&'a Worker> {
    let mut selected: Vec<&Worker> = workers.iter().filter(|w| w.role == role).collect();
    selected.sort_by_key(|w| w.role_index);
    selected
}

/// `<name>.<namespace>:<port>` for each worker of a role, comma-joined.
/// `port` overrides the worker's first declared port.
pub(crate) fn host_list(workers: &[Worker], namespace: &str, role: &str, port: Option<u16>) -> String {
    role_workers(workers, role)
        .into_iter()
        .map(|worker| match port.or_else(|| worker.ports.first().copied()) {
            Some(port) => format!("{}:{port}", worker.host(namespace)),
            None => worker.host(namespace),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Init container that blocks until every peer accepts TCP connections on
/// `port`, giving up after the configured number of probes.
pub(crate) fn peer_wait_container(
    config: &ManifestConfig,
    peers: &[String],
    port: u16,
) -> Option<Value> {
    if peers.is_empty() {
        return None;
    }
    let probes = peers
        .iter()
        .map(|host| format!("nc -z {host} {port}"))
        .collect::<Vec<_>>()
        .join(" && ");
    let max = config.peer_wait_max_attempts;
    let script = format!(
        "n=0; until {probes}; do n=$((n+1)); if [ \"$n\" -ge {max} ]; then echo \"peers not reachable after {max} attempts\" >&2; exit 1; fi; sleep {}; done",
        config.peer_wait_interval_secs
    );
    Some(manifest::init_container(
        "wait-worker-ready",
        &config.wait_image,
        &script,
        init_resources("64Mi"),
        Vec::new(),
    ))
}

pub(crate) fn init_resources(memory: &str) -> Value {
    json!({
        "requests": { "cpu": "100m", "memory": memory },
        "limits": { "cpu": "2", "memory": memory },
    })
}

/// `0,1,...,n-1` for a worker's GPUs, or `None` without GPUs.
pub(crate) fn gpu_list(worker: &Worker) -> Option<String> {
    worker.resources.gpu.filter(|gpu| *gpu > 0).map(|gpu| {
        (0..gpu)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use crate::config::{ManifestConfig, ResourceDefaults};
    use crate::dataspec::JobData;
    use crate::job::{plan_workers, Job, JobKey, JobSpec, RoleSpec, Worker};
    use crate::storage::{StorageKind, StorageMode};

    use super::Engine;

    pub fn job(engine: Engine, roles: &[(&str, u32, Option<u32>)]) -> Job {
        let resource_spec: BTreeMap<String, RoleSpec> = roles
            .iter()
            .map(|(role, count, gpu)| {
                (
                    role.to_string(),
                    RoleSpec {
                        entry_point: "python train.py".into(),
                        args: vec!["--epochs".into(), "3".into()],
                        count: *count,
                        gpu: *gpu,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Job::new(JobSpec {
            key: JobKey::new("alice", "team", "7"),
            engine,
            distribute: engine.distribute_type(&resource_spec),
            image: "trainer:latest".into(),
            code_spec: None,
            resource_spec,
            input_spec: BTreeMap::new(),
            output_spec: BTreeMap::new(),
            log_dir: None,
            storage: StorageMode::new(StorageKind::Filesystem),
            envs: BTreeMap::new(),
            debug: false,
            need_report: false,
            token: None,
            ingress: None,
        })
    }

    pub fn workers(job: &Job) -> Vec<Worker> {
        plan_workers(job, &ResourceDefaults::default())
    }

    pub fn config() -> ManifestConfig {
        ManifestConfig {
            peer_wait_max_attempts: 5,
            peer_wait_interval_secs: 2,
            ..Default::default()
        }
    }

    pub fn data() -> JobData {
        JobData::default()
    }
}
