//! Resolution of declared data locations into mounts and staging commands.
//!
//! In-container layout is fixed by kind:
//! - source code under `/AVES/src`
//! - input `<name>` under `/AVES/data/<name>`
//! - output `<name>` under `/AVES/output/<name>`
//!
//! Object-storage locations are staged with shell commands and never mounted;
//! volume-claim and host-path locations are always mounted natively.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AvesError;
use crate::job::JobSpec;

pub const SOURCE_ROOT: &str = "/AVES/src";
pub const DATA_ROOT: &str = "/AVES/data";
pub const OUTPUT_ROOT: &str = "/AVES/output";

const MAX_VOLUME_NAME: usize = 63;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    SourceCode,
    Input,
    Output,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::SourceCode => "src",
            DataKind::Input => "input",
            DataKind::Output => "output",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LocationType {
    #[serde(rename = "OSSFile")]
    ObjectFile,
    #[serde(rename = "K8SPVC")]
    VolumeClaim,
    #[serde(rename = "HostPath")]
    HostPath,
}

/// Object-store endpoint plus the credentials profile used to reach it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreRef {
    pub endpoint: String,
    #[serde(default)]
    pub profile_name: Option<String>,
}

impl ObjectStoreRef {
    fn cli(&self) -> String {
        match &self.profile_name {
            Some(profile) if !profile.is_empty() => format!(
                "aws --endpoint-url {} --profile {} s3",
                self.endpoint, profile
            ),
            _ => format!("aws --endpoint-url {} s3", self.endpoint),
        }
    }
}

/// A data location as declared in a submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLocation {
    #[serde(rename = "type")]
    pub location_type: LocationType,
    pub path: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub pvc: Option<String>,
    #[serde(default)]
    pub storage_config: Option<ObjectStoreRef>,
}

impl DataLocation {
    pub fn host_path(path: impl Into<String>) -> Self {
        Self {
            location_type: LocationType::HostPath,
            path: path.into(),
            filename: String::new(),
            pvc: None,
            storage_config: None,
        }
    }

    pub fn volume_claim(pvc: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            location_type: LocationType::VolumeClaim,
            path: path.into(),
            filename: String::new(),
            pvc: Some(pvc.into()),
            storage_config: None,
        }
    }

    pub fn object(path: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            location_type: LocationType::ObjectFile,
            path: path.into(),
            filename: String::new(),
            pvc: None,
            storage_config: Some(ObjectStoreRef {
                endpoint: endpoint.into(),
                profile_name: None,
            }),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn is_object(&self) -> bool {
        self.location_type == LocationType::ObjectFile
    }
}

/// Volume plus the container mount that attaches it.
#[derive(Clone, Debug, PartialEq)]
pub struct Mount {
    pub volume: Value,
    pub volume_mount: Value,
}

/// One resolved data location.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSpec {
    pub kind: DataKind,
    pub name: String,
    pub location: DataLocation,
}

impl DataSpec {
    pub fn new(
        kind: DataKind,
        name: impl Into<String>,
        location: DataLocation,
    ) -> Result<Self, AvesError> {
        let spec = Self {
            kind,
            name: name.into(),
            location,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn source(location: DataLocation) -> Result<Self, AvesError> {
        Self::new(DataKind::SourceCode, "src", location)
    }

    fn validate(&self) -> Result<(), AvesError> {
        let label = self.label();
        if self.location.path.trim().is_empty() {
            return Err(AvesError::validation(format!("{label}: path is empty")));
        }
        match self.location.location_type {
            LocationType::VolumeClaim => {
                if self.location.pvc.as_deref().is_none_or(str::is_empty) {
                    return Err(AvesError::validation(format!(
                        "{label}: K8SPVC location requires pvc"
                    )));
                }
            }
            LocationType::ObjectFile => {
                if self
                    .location
                    .storage_config
                    .as_ref()
                    .is_none_or(|cfg| cfg.endpoint.is_empty())
                {
                    return Err(AvesError::validation(format!(
                        "{label}: OSSFile location requires storage_config.endpoint"
                    )));
                }
            }
            LocationType::HostPath => {
                if !self.location.path.starts_with('/') {
                    return Err(AvesError::validation(format!(
                        "{label}: host path must be absolute"
                    )));
                }
            }
        }
        Ok(())
    }

    fn label(&self) -> String {
        format!("{} {}", self.kind.as_str(), self.name)
    }

    /// Directory the data occupies inside the container.
    pub fn container_dir(&self) -> String {
        match self.kind {
            DataKind::SourceCode => SOURCE_ROOT.to_string(),
            DataKind::Input => format!("{DATA_ROOT}/{}", self.name),
            DataKind::Output => format!("{OUTPUT_ROOT}/{}", self.name),
        }
    }

    /// Path handed to user code; includes the file name when one was declared.
    pub fn container_path(&self) -> String {
        let dir = self.container_dir();
        if self.location.filename.is_empty() {
            dir
        } else {
            format!("{dir}/{}", self.location.filename)
        }
    }

    pub fn read_only(&self) -> bool {
        self.kind != DataKind::Output
    }

    /// DNS-label volume name; `ordinal` keeps names unique once the data
    /// name is folded to lowercase alphanumerics.
    pub fn volume_name(&self, ordinal: usize) -> String {
        let mut name = format!("{}-{ordinal}-", self.kind.as_str());
        name.extend(self.name.chars().map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        }));
        name.truncate(MAX_VOLUME_NAME);
        name.trim_end_matches('-').to_string()
    }

    /// ` --<name> <container path>` appended to the user entrypoint.
    pub fn arg(&self) -> String {
        format!(" --{} {}", self.name, self.container_path())
    }

    /// Native volume attachment, or `None` for object-storage locations.
    pub fn mount(&self, ordinal: usize) -> Option<Mount> {
        let name = self.volume_name(ordinal);
        match self.location.location_type {
            LocationType::ObjectFile => None,
            LocationType::VolumeClaim => {
                let claim = self.location.pvc.clone().unwrap_or_default();
                let mut volume_mount = json!({
                    "name": name,
                    "mountPath": self.container_dir(),
                    "readOnly": self.read_only(),
                });
                let sub_path = self.location.path.trim_start_matches('/');
                if !sub_path.is_empty() {
                    volume_mount["subPath"] = json!(sub_path);
                }
                Some(Mount {
                    volume: json!({
                        "name": name,
                        "persistentVolumeClaim": { "claimName": claim },
                    }),
                    volume_mount,
                })
            }
            LocationType::HostPath => Some(Mount {
                volume: json!({
                    "name": name,
                    "hostPath": { "path": self.location.path },
                }),
                volume_mount: json!({
                    "name": name,
                    "mountPath": self.container_dir(),
                    "readOnly": self.read_only(),
                }),
            }),
        }
    }

    /// Download step run before user code; empty for mounted locations.
    pub fn stage_command(&self) -> String {
        let Some(store) = self.object_store() else {
            return String::new();
        };
        let dir = self.container_dir();
        match self.kind {
            DataKind::Output => format!("mkdir -p {} ;", shell_quote(&dir)),
            DataKind::SourceCode | DataKind::Input if self.location.filename.is_empty() => {
                format!(
                    "mkdir -p {} && {} sync {} {} ;",
                    shell_quote(&dir),
                    store.cli(),
                    shell_quote(&with_trailing_slash(&self.location.path)),
                    shell_quote(&format!("{dir}/"))
                )
            }
            DataKind::SourceCode | DataKind::Input => format!(
                "mkdir -p {} && {} cp {} {} ;",
                shell_quote(&dir),
                store.cli(),
                shell_quote(&format!(
                    "{}{}",
                    with_trailing_slash(&self.location.path),
                    self.location.filename
                )),
                shell_quote(&format!("{dir}/{}", self.location.filename))
            ),
        }
    }

    /// Upload step run after user code; only object-storage outputs have one.
    pub fn gather_command(&self) -> String {
        match (self.kind, self.object_store()) {
            (DataKind::Output, Some(store)) => format!(
                "{} sync {} {} ;",
                store.cli(),
                shell_quote(&format!("{}/", self.container_dir())),
                shell_quote(&with_trailing_slash(&self.location.path))
            ),
            _ => String::new(),
        }
    }

    fn object_store(&self) -> Option<&ObjectStoreRef> {
        if self.location.is_object() {
            self.location.storage_config.as_ref()
        } else {
            None
        }
    }
}

/// All data locations of a job, resolved and validated once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobData {
    pub source: Option<DataSpec>,
    pub inputs: Vec<DataSpec>,
    pub outputs: Vec<DataSpec>,
}

impl JobData {
    pub fn resolve(spec: &JobSpec) -> Result<Self, AvesError> {
        let source = spec.code_spec.clone().map(DataSpec::source).transpose()?;
        let inputs = spec
            .input_spec
            .iter()
            .map(|(name, location)| DataSpec::new(DataKind::Input, name, location.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = spec
            .output_spec
            .iter()
            .map(|(name, location)| DataSpec::new(DataKind::Output, name, location.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source,
            inputs,
            outputs,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataSpec> {
        self.source
            .iter()
            .chain(self.inputs.iter())
            .chain(self.outputs.iter())
    }

    /// Input then output arguments for the user entrypoint.
    pub fn args(&self) -> String {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(DataSpec::arg)
            .collect()
    }

    pub fn mounts(&self) -> Vec<Mount> {
        self.iter()
            .enumerate()
            .filter_map(|(ordinal, spec)| spec.mount(ordinal))
            .collect()
    }

    pub fn stage_commands(&self) -> String {
        join_commands(self.iter().map(DataSpec::stage_command))
    }

    pub fn gather_commands(&self) -> String {
        join_commands(self.iter().map(DataSpec::gather_command))
    }
}

fn join_commands(commands: impl Iterator<Item = String>) -> String {
    commands
        .filter(|command| !command.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-quote `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_by_kind() {
        let src = DataSpec::source(DataLocation::host_path("/mnt/code")).expect("valid");
        assert_eq!(src.container_path(), "/AVES/src");

        let input = DataSpec::new(
            DataKind::Input,
            "train_data",
            DataLocation::host_path("/mnt/data").with_filename("a.csv"),
        )
        .expect("valid");
        assert_eq!(input.container_path(), "/AVES/data/train_data/a.csv");
        assert_eq!(input.arg(), " --train_data /AVES/data/train_data/a.csv");
        assert_eq!(input.volume_name(1), "input-1-train-data");

        let output =
            DataSpec::new(DataKind::Output, "model", DataLocation::host_path("/mnt/out")).expect("valid");
        assert_eq!(output.container_dir(), "/AVES/output/model");
        assert!(!output.read_only());
    }

    #[test]
    fn test_volume_claim_mount_uses_sub_path() {
        let spec = DataSpec::new(
            DataKind::Input,
            "images",
            DataLocation::volume_claim("shared-pvc", "/datasets/imagenet"),
        )
        .expect("valid");
        let mount = spec.mount(0).expect("pvc mounts");
        assert_eq!(mount.volume["persistentVolumeClaim"]["claimName"], "shared-pvc");
        assert_eq!(mount.volume_mount["subPath"], "datasets/imagenet");
        assert_eq!(mount.volume_mount["readOnly"], true);
        assert!(spec.stage_command().is_empty());
        assert!(spec.gather_command().is_empty());
    }

    #[test]
    fn test_volume_claim_root_has_no_sub_path() {
        let spec = DataSpec::new(
            DataKind::Output,
            "ckpt",
            DataLocation::volume_claim("out-pvc", "/"),
        )
        .expect("valid");
        let mount = spec.mount(0).expect("pvc mounts");
        assert!(mount.volume_mount.get("subPath").is_none());
        assert_eq!(mount.volume_mount["readOnly"], false);
    }

    #[test]
    fn test_object_location_stages_instead_of_mounting() {
        let input = DataSpec::new(
            DataKind::Input,
            "corpus",
            DataLocation::object("s3://bucket/corpus", "http://oss:9000"),
        )
        .expect("valid");
        assert!(input.mount(0).is_none());
        assert_eq!(
            input.stage_command(),
            "mkdir -p '/AVES/data/corpus' && aws --endpoint-url http://oss:9000 s3 sync 's3://bucket/corpus/' '/AVES/data/corpus/' ;"
        );
        assert!(input.gather_command().is_empty());

        let output = DataSpec::new(
            DataKind::Output,
            "model",
            DataLocation::object("s3://bucket/model/", "http://oss:9000"),
        )
        .expect("valid");
        assert_eq!(output.stage_command(), "mkdir -p '/AVES/output/model' ;");
        assert_eq!(
            output.gather_command(),
            "aws --endpoint-url http://oss:9000 s3 sync '/AVES/output/model/' 's3://bucket/model/' ;"
        );
    }

    #[test]
    fn test_object_single_file_uses_cp() {
        let mut location = DataLocation::object("s3://bucket/cfg", "http://oss:9000").with_filename("a.yaml");
        if let Some(cfg) = location.storage_config.as_mut() {
            cfg.profile_name = Some("team".into());
        }
        let spec = DataSpec::new(DataKind::Input, "cfg", location).expect("valid");
        assert_eq!(
            spec.stage_command(),
            "mkdir -p '/AVES/data/cfg' && aws --endpoint-url http://oss:9000 --profile team s3 cp 's3://bucket/cfg/a.yaml' '/AVES/data/cfg/a.yaml' ;"
        );
    }

    #[test]
    fn test_invalid_locations_rejected() {
        let missing_pvc = DataLocation {
            pvc: None,
            ..DataLocation::volume_claim("x", "/data")
        };
        assert!(matches!(
            DataSpec::new(DataKind::Input, "d", missing_pvc),
            Err(AvesError::Validation(_))
        ));

        let relative = DataLocation::host_path("data");
        assert!(DataSpec::new(DataKind::Input, "d", relative).is_err());

        let no_endpoint = DataLocation {
            storage_config: None,
            ..DataLocation::object("s3://b/p", "e")
        };
        assert!(DataSpec::new(DataKind::Input, "d", no_endpoint).is_err());
    }

    #[test]
    fn test_job_data_commands_skip_mounted_specs() {
        let data = JobData {
            source: Some(DataSpec::source(DataLocation::host_path("/mnt/code")).expect("valid")),
            inputs: vec![DataSpec::new(
                DataKind::Input,
                "corpus",
                DataLocation::object("s3://b/corpus", "http://oss"),
            )
            .expect("valid")],
            outputs: vec![DataSpec::new(DataKind::Output, "model", DataLocation::host_path("/mnt/out"))
                .expect("valid")],
        };
        assert_eq!(data.mounts().len(), 2);
        assert_eq!(
            data.args(),
            " --corpus /AVES/data/corpus --model /AVES/output/model"
        );
        assert!(data.stage_commands().starts_with("mkdir -p '/AVES/data/corpus' &&"));
        assert!(data.gather_commands().is_empty());
    }

    #[test]
    fn test_folded_names_get_distinct_volumes() {
        let data = JobData {
            source: None,
            inputs: vec![
                DataSpec::new(DataKind::Input, "a_b", DataLocation::host_path("/mnt/x")).expect("valid"),
                DataSpec::new(DataKind::Input, "a-b", DataLocation::host_path("/mnt/y")).expect("valid"),
                DataSpec::new(DataKind::Input, "A.B", DataLocation::host_path("/mnt/z")).expect("valid"),
            ],
            outputs: vec![],
        };
        let names: Vec<String> = data
            .mounts()
            .iter()
            .map(|m| m.volume["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["input-0-a-b", "input-1-a-b", "input-2-a-b"]);
        for mount in data.mounts() {
            assert_eq!(mount.volume["name"], mount.volume_mount["name"]);
        }
    }

    #[test]
    fn test_volume_name_is_a_dns_label() {
        let long = "x".repeat(80);
        let spec = DataSpec::new(DataKind::Output, &long, DataLocation::host_path("/mnt/out")).expect("valid");
        let name = spec.volume_name(3);
        assert_eq!(name.len(), MAX_VOLUME_NAME);
        assert!(name.starts_with("output-3-xxx"));

        let trailing = DataSpec::new(DataKind::Output, "ckpt_", DataLocation::host_path("/mnt/out")).expect("valid");
        assert_eq!(trailing.volume_name(0), "output-0-ckpt");
    }

    #[test]
    fn test_paths_with_spaces_and_quotes_are_quoted() {
        let input = DataSpec::new(
            DataKind::Input,
            "corpus",
            DataLocation::object("s3://bucket/it's here", "http://oss:9000"),
        )
        .expect("valid");
        assert_eq!(
            input.stage_command(),
            r"mkdir -p '/AVES/data/corpus' && aws --endpoint-url http://oss:9000 s3 sync 's3://bucket/it'\''s here/' '/AVES/data/corpus/' ;"
        );
        assert_eq!(shell_quote("a b; rm -rf /"), "'a b; rm -rf /'");
    }
}
