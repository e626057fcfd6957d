//! Wire form of a job submission and its translation into a [`JobSpec`].
//!
//! Everything that can be rejected is rejected here, before a job record or
//! any orchestrator resource exists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::affinity::selector_from_strategy;
use crate::dataspec::{DataLocation, JobData};
use crate::engine::Engine;
use crate::error::AvesError;
use crate::job::{IngressSpec, JobKey, JobSpec, RoleSpec};
use crate::storage::{strategy_for, StorageConfig, StorageKind, StorageMode};

/// Per-role block of a submission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSubmission {
    #[serde(default)]
    pub entry_point: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default, rename = "nvidia.com/gpu")]
    pub gpu: Option<u32>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, rename = "ScheduleStrategy")]
    pub schedule_strategy: Option<Value>,
}

fn default_count() -> u32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageModeSubmission {
    pub mode: String,
    #[serde(default)]
    pub config: StorageConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub job_id: String,
    pub username: String,
    pub namespace: String,
    pub engine: String,
    pub image: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub code_spec: Option<DataLocation>,
    #[serde(default)]
    pub input_spec: BTreeMap<String, DataLocation>,
    #[serde(default)]
    pub output_spec: BTreeMap<String, DataLocation>,
    #[serde(default)]
    pub log_dir: Option<String>,
    pub resource_spec: BTreeMap<String, RoleSubmission>,
    #[serde(default)]
    pub storage_mode: Option<StorageModeSubmission>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub need_report: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ingress: Option<IngressSpec>,
}

fn require(field: &str, value: &str) -> Result<(), AvesError> {
    if value.trim().is_empty() {
        return Err(AvesError::validation(format!("{field} is required")));
    }
    Ok(())
}

impl JobSubmission {
    /// Validate the submission and derive the distribution tag.
    pub fn into_spec(self) -> Result<JobSpec, AvesError> {
        require("jobId", &self.job_id)?;
        require("username", &self.username)?;
        require("namespace", &self.namespace)?;
        require("image", &self.image)?;

        let engine: Engine = self.engine.parse()?;
        let storage = match self.storage_mode {
            Some(mode) => StorageMode {
                mode: mode.mode.parse::<StorageKind>()?,
                config: mode.config,
            },
            None => StorageMode::new(StorageKind::Filesystem),
        };

        let mut resource_spec = BTreeMap::new();
        for (role, spec) in self.resource_spec {
            if spec.count < 1 {
                return Err(AvesError::validation(format!(
                    "resourceSpec.{role}.count must be at least 1"
                )));
            }
            if spec.entry_point.trim().is_empty() {
                return Err(AvesError::validation(format!(
                    "resourceSpec.{role}.entryPoint is required"
                )));
            }
            selector_from_strategy(spec.schedule_strategy.as_ref()).map_err(|err| match err {
                AvesError::Validation(msg) => {
                    AvesError::Validation(format!("resourceSpec.{role}: {msg}"))
                }
                other => other,
            })?;
            resource_spec.insert(
                role,
                RoleSpec {
                    entry_point: spec.entry_point,
                    args: spec.args,
                    cpu: spec.cpu,
                    memory: spec.memory,
                    gpu: spec.gpu,
                    count: spec.count,
                    port: spec.port,
                    schedule_strategy: spec.schedule_strategy,
                },
            );
        }
        engine.validate_roles(&resource_spec, !self.output_spec.is_empty())?;

        let spec = JobSpec {
            key: JobKey::new(self.username, self.namespace, self.job_id),
            engine,
            distribute: engine.distribute_type(&resource_spec),
            image: self.image,
            code_spec: self.code_spec,
            resource_spec,
            input_spec: self.input_spec,
            output_spec: self.output_spec,
            log_dir: self.log_dir.filter(|dir| !dir.trim().is_empty()),
            storage,
            envs: self.envs,
            debug: self.debug,
            need_report: self.need_report,
            token: self.token,
            ingress: self.ingress,
        };

        let data = JobData::resolve(&spec)?;
        strategy_for(&spec.storage).validate(&spec, &data)?;
        Ok(spec)
    }
}
