//! Storage modes: how source code and data reach a worker container.
//!
//! A [`StorageStrategy`] is handed to the manifest generators and decides the
//! volumes, mounts, env and the shell wrapper around the user command. The
//! engine decides what the command is; the strategy decides how data is
//! staged around it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dataspec::{shell_quote, DataSpec, JobData, SOURCE_ROOT};
use crate::engine::RenderContext;
use crate::error::AvesError;
use crate::job::JobSpec;

const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;
const WRAPPER_GRACE_PERIOD_SECS: u64 = 120;
const WORKSPACE_ROOT: &str = "/AVES";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// Native mounts, inline staging for object locations.
    Filesystem,
    /// Object paths handed straight to user code.
    #[serde(rename = "OSS")]
    Oss,
    /// Node-local workspace driven by the run wrapper.
    #[serde(rename = "OSSFile")]
    OssFile,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Filesystem => "Filesystem",
            StorageKind::Oss => "OSS",
            StorageKind::OssFile => "OSSFile",
        }
    }
}

impl FromStr for StorageKind {
    type Err = AvesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [StorageKind::Filesystem, StorageKind::Oss, StorageKind::OssFile]
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AvesError::validation(format!("unknown storage mode {s:?}")))
    }
}

/// Credentials and endpoint for the object-path mode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMode {
    pub mode: StorageKind,
    #[serde(default)]
    pub config: StorageConfig,
}

impl StorageMode {
    pub fn new(mode: StorageKind) -> Self {
        Self {
            mode,
            config: StorageConfig::default(),
        }
    }
}

/// Data-staging policy composed into every generated manifest.
pub trait StorageStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> StorageKind;

    /// Reject jobs whose data locations this mode cannot serve.
    fn validate(&self, _spec: &JobSpec, _data: &JobData) -> Result<(), AvesError> {
        Ok(())
    }

    fn volumes(&self, ctx: &RenderContext<'_>) -> Vec<Value>;

    fn volume_mounts(&self, ctx: &RenderContext<'_>) -> Vec<Value>;

    fn envs(&self, _ctx: &RenderContext<'_>) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Data arguments appended to the user entrypoint.
    fn data_args(&self, data: &JobData) -> String {
        data.args()
    }

    /// Full shell script for a worker running user code.
    fn run_script(&self, ctx: &RenderContext<'_>, command: &str) -> String;

    /// Shell script for a worker that only hosts a daemon.
    fn standby_script(&self, ctx: &RenderContext<'_>, daemon: &str) -> String;

    fn grace_period_secs(&self) -> u64 {
        DEFAULT_GRACE_PERIOD_SECS
    }
}

/// Strategy implementing a storage mode.
pub fn strategy_for(mode: &StorageMode) -> Arc<dyn StorageStrategy> {
    match mode.mode {
        StorageKind::Filesystem => Arc::new(FilesystemStorage),
        StorageKind::Oss => Arc::new(ObjectPathStorage {
            config: mode.config.clone(),
        }),
        StorageKind::OssFile => Arc::new(WrapperStorage),
    }
}

fn base_volumes() -> Vec<Value> {
    vec![
        json!({ "name": "dshm", "emptyDir": { "medium": "Memory" } }),
        json!({ "name": "tz-config", "hostPath": { "path": "/etc/localtime" } }),
    ]
}

fn base_volume_mounts() -> Vec<Value> {
    vec![
        json!({ "name": "dshm", "mountPath": "/dev/shm" }),
        json!({ "name": "tz-config", "mountPath": "/etc/localtime", "readOnly": true }),
    ]
}

fn workspace_prepare() -> String {
    format!("mkdir -p {SOURCE_ROOT} ; cd {SOURCE_ROOT} ;")
}

fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Mounted-filesystem mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilesystemStorage;

impl FilesystemStorage {
    fn runlog_enabled(ctx: &RenderContext<'_>) -> bool {
        ctx.job.spec.log_dir.is_some()
    }
}

impl StorageStrategy for FilesystemStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Filesystem
    }

    fn volumes(&self, ctx: &RenderContext<'_>) -> Vec<Value> {
        let mut volumes = base_volumes();
        volumes.extend(ctx.data.mounts().into_iter().map(|m| m.volume));
        if let Some(log_dir) = &ctx.job.spec.log_dir {
            volumes.push(json!({ "name": "runlog", "hostPath": { "path": log_dir } }));
        }
        volumes
    }

    fn volume_mounts(&self, ctx: &RenderContext<'_>) -> Vec<Value> {
        let mut mounts = base_volume_mounts();
        mounts.extend(ctx.data.mounts().into_iter().map(|m| m.volume_mount));
        if Self::runlog_enabled(ctx) {
            mounts.push(json!({ "name": "runlog", "mountPath": ctx.config.runlog_dir }));
        }
        mounts
    }

    fn run_script(&self, ctx: &RenderContext<'_>, command: &str) -> String {
        let exec = if Self::runlog_enabled(ctx) {
            format!(
                "( {command} ) 2>&1 | tee {}/{}.log ; rc=${{PIPESTATUS[0]}} ;",
                ctx.config.runlog_dir, ctx.worker.name
            )
        } else {
            format!("{command} ; rc=$? ;")
        };
        join(&[
            &workspace_prepare(),
            &ctx.data.stage_commands(),
            &exec,
            &ctx.data.gather_commands(),
            "exit $rc",
        ])
    }

    fn standby_script(&self, ctx: &RenderContext<'_>, daemon: &str) -> String {
        join(&[&workspace_prepare(), &ctx.data.stage_commands(), daemon])
    }
}

/// Object-path mode: user code reads and writes object storage directly.
#[derive(Clone, Debug, Default)]
pub struct ObjectPathStorage {
    config: StorageConfig,
}

impl ObjectPathStorage {
    fn object_path(spec: &DataSpec) -> String {
        let path = spec.location.path.trim_end_matches('/');
        if spec.location.filename.is_empty() {
            path.to_string()
        } else {
            format!("{path}/{}", spec.location.filename)
        }
    }

    fn s3cfg(&self) -> String {
        format!(
            "echo -e \"[default]\\naccess_key = {}\\nsecret_key = {}\\nhost_base = {}\\nhost_bucket = \\nuse_https = False\" > /root/.s3cfg ;",
            self.config.access_key.as_deref().unwrap_or_default(),
            self.config.secret_key.as_deref().unwrap_or_default(),
            self.config.endpoint.as_deref().unwrap_or_default(),
        )
    }

    fn sync_source(&self, ctx: &RenderContext<'_>) -> String {
        match &ctx.data.source {
            Some(source) => format!(
                "s3cmd sync {} {SOURCE_ROOT}/ ;",
                shell_quote(&format!("{}/", source.location.path.trim_end_matches('/')))
            ),
            None => String::new(),
        }
    }

    fn prepare(&self, ctx: &RenderContext<'_>) -> String {
        join(&[&workspace_prepare(), &self.s3cfg(), &self.sync_source(ctx)])
    }
}

impl StorageStrategy for ObjectPathStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Oss
    }

    fn validate(&self, _spec: &JobSpec, data: &JobData) -> Result<(), AvesError> {
        for field in [
            ("endpoint", &self.config.endpoint),
            ("access_key", &self.config.access_key),
            ("secret_key", &self.config.secret_key),
        ] {
            if field.1.as_deref().is_none_or(str::is_empty) {
                return Err(AvesError::validation(format!(
                    "storage mode OSS requires config.{}",
                    field.0
                )));
            }
        }
        for spec in data.iter() {
            if !spec.location.is_object() || !spec.location.path.starts_with("s3://") {
                return Err(AvesError::validation(format!(
                    "storage mode OSS requires s3:// object locations, {} {} is {:?}",
                    spec.kind.as_str(),
                    spec.name,
                    spec.location.path
                )));
            }
        }
        Ok(())
    }

    fn volumes(&self, _ctx: &RenderContext<'_>) -> Vec<Value> {
        base_volumes()
    }

    fn volume_mounts(&self, _ctx: &RenderContext<'_>) -> Vec<Value> {
        base_volume_mounts()
    }

    fn envs(&self, _ctx: &RenderContext<'_>) -> Vec<(String, String)> {
        vec![
            (
                "AWS_ACCESS_KEY_ID".into(),
                self.config.access_key.clone().unwrap_or_default(),
            ),
            (
                "AWS_SECRET_ACCESS_KEY".into(),
                self.config.secret_key.clone().unwrap_or_default(),
            ),
            (
                "S3_ENDPOINT".into(),
                self.config.endpoint.clone().unwrap_or_default(),
            ),
            ("S3_USE_HTTPS".into(), "0".into()),
        ]
    }

    fn data_args(&self, data: &JobData) -> String {
        data.inputs
            .iter()
            .chain(data.outputs.iter())
            .map(|spec| format!(" --{} {}", spec.name, Self::object_path(spec)))
            .collect()
    }

    fn run_script(&self, ctx: &RenderContext<'_>, command: &str) -> String {
        join(&[&self.prepare(ctx), &format!("{command} ;")])
    }

    fn standby_script(&self, ctx: &RenderContext<'_>, daemon: &str) -> String {
        join(&[&self.prepare(ctx), daemon])
    }
}

/// Object-file mode: a run wrapper stages data on node-local disk, runs the
/// command, gathers outputs and wipes the workspace.
#[derive(Clone, Copy, Debug, Default)]
pub struct WrapperStorage;

impl WrapperStorage {
    fn quote(command: &str) -> String {
        command.replace('\\', "\\\\").replace('"', "\\\"")
    }

    fn fetch_wrapper(ctx: &RenderContext<'_>) -> String {
        format!(
            "wget -q -O aves_run_wrapper.sh {} ;",
            ctx.config.wrapper_url
        )
    }
}

impl StorageStrategy for WrapperStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::OssFile
    }

    fn volumes(&self, ctx: &RenderContext<'_>) -> Vec<Value> {
        let mut volumes = base_volumes();
        volumes.push(json!({
            "name": "pv-dir",
            "hostPath": {
                "path": format!(
                    "{}/{}",
                    ctx.config.node_local_dir.trim_end_matches('/'),
                    ctx.worker.name
                )
            }
        }));
        volumes.extend(ctx.data.mounts().into_iter().map(|m| m.volume));
        volumes
    }

    fn volume_mounts(&self, ctx: &RenderContext<'_>) -> Vec<Value> {
        let mut mounts = base_volume_mounts();
        mounts.push(json!({ "name": "pv-dir", "mountPath": WORKSPACE_ROOT }));
        mounts.extend(ctx.data.mounts().into_iter().map(|m| m.volume_mount));
        mounts
    }

    fn run_script(&self, ctx: &RenderContext<'_>, command: &str) -> String {
        let post = join(&[
            &ctx.data.gather_commands(),
            &format!("cd {WORKSPACE_ROOT} && /bin/rm -rf {SOURCE_ROOT} {WORKSPACE_ROOT}/data"),
        ]);
        join(&[
            &workspace_prepare(),
            &Self::fetch_wrapper(ctx),
            "exec /bin/sh aves_run_wrapper.sh",
            &format!("--pre_cmd \"{}\"", Self::quote(&ctx.data.stage_commands())),
            &format!("--exec_cmd \"{}\"", Self::quote(command)),
            &format!("--post_cmd \"{}\" ;", Self::quote(&post)),
        ])
    }

    fn standby_script(&self, ctx: &RenderContext<'_>, daemon: &str) -> String {
        join(&[&workspace_prepare(), &ctx.data.stage_commands(), daemon])
    }

    fn grace_period_secs(&self) -> u64 {
        WRAPPER_GRACE_PERIOD_SECS
    }
}
