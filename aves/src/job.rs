use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ResourceDefaults;
use crate::dataspec::DataLocation;
use crate::engine::{Engine, Topology};
use crate::error::AvesError;
use crate::manifest::Manifest;
use crate::storage::StorageMode;

/// Synthetic identifier of a stored job record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Synthetic identifier of a stored worker record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-facing identity of a job: unique per (username, namespace).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub username: String,
    pub namespace: String,
    pub job_id: String,
}

impl JobKey {
    pub fn new(
        username: impl Into<String>,
        namespace: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            namespace: namespace.into(),
            job_id: job_id.into(),
        }
    }

    /// `<user>-<namespace>-<jobId>`, the prefix of every orchestrator object
    /// name created for this job.
    pub fn merged_id(&self) -> String {
        format!("{}-{}-{}", self.username, self.namespace, self.job_id)
    }

    /// Whether an orchestrator object name belongs to this job: the merged
    /// id itself or the merged id followed by `-` and a suffix.
    ///
    /// Any of the three parts may contain `-`, so ownership is decided
    /// against known keys rather than by splitting the name.
    pub fn owns_object(&self, object_name: &str) -> bool {
        object_name
            .strip_prefix(self.merged_id().as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'))
    }

    /// Names of objects created for some job have at least three non-empty
    /// hyphen-delimited segments.
    pub fn is_job_shaped(object_name: &str) -> bool {
        let mut parts = object_name.split('-');
        (0..3).all(|_| parts.next().is_some_and(|part| !part.is_empty()))
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.merged_id())
    }
}

/// Status vocabulary shared by jobs and workers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    New,
    Starting,
    Pending,
    Running,
    Finished,
    Failure,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::New,
        JobStatus::Starting,
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failure,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::Starting => "STARTING",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failure => "FAILURE",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Statuses from which `start` may (re)launch the job.
    pub fn is_ready_to_run(&self) -> bool {
        matches!(
            self,
            JobStatus::New | JobStatus::Finished | JobStatus::Failure | JobStatus::Canceled
        )
    }

    /// STARTING or RUNNING: orchestrator resources are expected to exist.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Starting | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failure | JobStatus::Canceled
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AvesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AvesError::validation(format!("unknown status {s:?}")))
    }
}

/// Distribution topology tag derived at submission time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DistributeType {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "TF-PS")]
    ParameterServer,
    #[serde(rename = "HOROVOD")]
    AllReduce,
    #[serde(rename = "SSH-RING")]
    SshRing,
}

impl DistributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributeType::None => "",
            DistributeType::ParameterServer => "TF-PS",
            DistributeType::AllReduce => "HOROVOD",
            DistributeType::SshRing => "SSH-RING",
        }
    }
}

/// Declared resources and command for one role.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub entry_point: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    /// Quantity such as `"20Gi"`; a bare number is read as Gi.
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub gpu: Option<u32>,
    pub count: u32,
    #[serde(default)]
    pub port: Option<u16>,
    /// Raw scheduling constraints, validated by [`crate::affinity`].
    #[serde(default)]
    pub schedule_strategy: Option<serde_json::Value>,
}

/// Ingress exposing the primary worker's service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressSpec {
    pub host: String,
    #[serde(default = "default_ingress_path")]
    pub path: String,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_ingress_path() -> String {
    "/".to_string()
}

/// Everything declared for a job at submission time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub key: JobKey,
    pub engine: Engine,
    pub distribute: DistributeType,
    pub image: String,
    pub code_spec: Option<DataLocation>,
    pub resource_spec: BTreeMap<String, RoleSpec>,
    pub input_spec: BTreeMap<String, DataLocation>,
    pub output_spec: BTreeMap<String, DataLocation>,
    /// Host directory receiving per-worker run logs.
    pub log_dir: Option<String>,
    pub storage: StorageMode,
    pub envs: BTreeMap<String, String>,
    pub debug: bool,
    pub need_report: bool,
    pub token: Option<String>,
    pub ingress: Option<IngressSpec>,
}

impl JobSpec {
    pub fn is_distribute(&self) -> bool {
        self.distribute != DistributeType::None
    }
}

/// Aggregate root for one submitted training run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            spec,
            status: JobStatus::New,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.spec.key
    }

    pub fn merged_id(&self) -> String {
        self.spec.key.merged_id()
    }

    pub fn namespace(&self) -> &str {
        &self.spec.key.namespace
    }

    pub fn is_distribute(&self) -> bool {
        self.spec.is_distribute()
    }
}

/// Resource requests of one worker; `None` fields are left out of manifests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: Option<u32>,
    pub memory: Option<String>,
    pub gpu: Option<u32>,
}

/// One orchestrator-schedulable unit of a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub job_id: JobId,
    pub role: String,
    pub role_index: u32,
    pub name: String,
    pub is_primary: bool,
    pub resources: ResourceRequest,
    pub entry_point: String,
    pub args: Vec<String>,
    pub ports: Vec<u16>,
    /// Decided by the engine when manifests are generated.
    #[serde(default)]
    pub topology: Topology,
    pub status: JobStatus,
    pub message: String,
    /// Last generated orchestrator resources, kept for deletion.
    pub manifests: Vec<Manifest>,
}

impl Worker {
    pub fn worker_name(merged_id: &str, role: &str, index: u32) -> String {
        format!("{merged_id}-{role}-{index}")
    }

    /// Whether an orchestrator object (the worker's job, controller or one of
    /// their pods) belongs to this worker.
    pub fn owns_object(&self, object_name: &str) -> bool {
        object_name == self.name
            || object_name
                .strip_prefix(self.name.as_str())
                .is_some_and(|rest| rest.starts_with('-') && !rest[1..].contains('-'))
    }

    /// `<name>.<namespace>`, resolvable through the worker's service.
    pub fn host(&self, namespace: &str) -> String {
        format!("{}.{}", self.name, namespace)
    }
}

/// Normalize a declared memory quantity; zero or empty means "not requested".
pub fn normalize_memory(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(digits_end);
    let value: f64 = amount.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    if unit.is_empty() {
        Some(format!("{amount}Gi"))
    } else {
        Some(trimmed.to_string())
    }
}

/// Pick the primary worker: index 0 of "master", else of "ps", else of
/// "worker", else the first planned worker.
pub fn select_primary(workers: &[Worker]) -> Option<usize> {
    ["master", "ps", "worker"]
        .iter()
        .find_map(|role| {
            workers
                .iter()
                .position(|w| w.role == *role && w.role_index == 0)
        })
        .or(if workers.is_empty() { None } else { Some(0) })
}

/// Expand the per-role specification into worker records, one per
/// (role, index), with exactly one primary.
pub fn plan_workers(job: &Job, defaults: &ResourceDefaults) -> Vec<Worker> {
    let merged_id = job.merged_id();
    let mut workers = Vec::new();

    for (role, spec) in &job.spec.resource_spec {
        for index in 0..spec.count.max(1) {
            let memory = spec
                .memory
                .as_deref()
                .or(defaults.memory.as_deref())
                .and_then(normalize_memory);
            workers.push(Worker {
                id: WorkerId::new(),
                job_id: job.id,
                role: role.clone(),
                role_index: index,
                name: Worker::worker_name(&merged_id, role, index),
                is_primary: false,
                resources: ResourceRequest {
                    cpu: spec.cpu.or(defaults.cpu).filter(|cpu| *cpu > 0),
                    memory,
                    gpu: spec.gpu.filter(|gpu| *gpu > 0),
                },
                entry_point: spec.entry_point.clone(),
                args: spec.args.clone(),
                ports: job.spec.engine.resolve_ports(spec.port),
                topology: Topology::default(),
                status: JobStatus::New,
                message: String::new(),
                manifests: Vec::new(),
            });
        }
    }

    if let Some(primary) = select_primary(&workers) {
        workers[primary].is_primary = true;
    }
    workers
}
