//! Orchestrator object builders.
//!
//! Manifests are plain JSON documents so they can be cached on worker
//! records and replayed through any orchestrator client.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::job::ResourceRequest;

/// Object kinds this core creates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Job,
    ReplicationController,
    Service,
    Ingress,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Job => "Job",
            ResourceKind::ReplicationController => "ReplicationController",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::Job => "batch/v1",
            ResourceKind::ReplicationController | ResourceKind::Service => "v1",
            ResourceKind::Ingress => "networking.k8s.io/v1",
        }
    }

    /// Kinds whose pods run worker containers.
    pub fn is_workload(&self) -> bool {
        matches!(self, ResourceKind::Job | ResourceKind::ReplicationController)
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rendered orchestrator object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: ResourceKind,
    pub name: String,
    pub body: Value,
}

/// Exact-match label selector, rendered as comma-joined `k=v` pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Selects everything created for one worker.
    pub fn for_worker(worker_name: &str) -> Self {
        Self::new().with(APP_LABEL, worker_name)
    }

    /// Selects everything created for one job.
    pub fn for_job(merged_id: &str) -> Self {
        Self::new().with(JOB_LABEL, merged_id)
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&pairs.join(","))
    }
}

pub const APP_LABEL: &str = "app";
pub const JOB_LABEL: &str = "jobId";

fn labels(name: &str, merged_id: &str) -> Value {
    json!({ APP_LABEL: name, JOB_LABEL: merged_id })
}

/// Resource requests/limits; absent quantities are left out entirely.
pub fn resources(request: &ResourceRequest, gpu_resource: &str) -> Value {
    let mut quantities = serde_json::Map::new();
    if let Some(cpu) = request.cpu {
        quantities.insert("cpu".into(), json!(cpu.to_string()));
    }
    if let Some(memory) = &request.memory {
        quantities.insert("memory".into(), json!(memory));
    }
    if let Some(gpu) = request.gpu {
        quantities.insert(gpu_resource.into(), json!(gpu.to_string()));
    }
    if quantities.is_empty() {
        return json!({});
    }
    json!({ "requests": quantities.clone(), "limits": quantities })
}

/// Main container of a worker pod.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Ordered; later entries override earlier ones inside the container.
    pub env: Vec<(String, String)>,
    pub ports: Vec<u16>,
    pub resources: Value,
    pub volume_mounts: Vec<Value>,
}

impl ContainerSpec {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_value(&self) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|port| json!({ "containerPort": port, "name": format!("{port}-port") }))
            .collect();
        json!({
            "name": self.name,
            "image": self.image,
            "imagePullPolicy": "Always",
            "ports": ports,
            "env": env,
            "command": self.command,
            "args": self.args,
            "resources": self.resources,
            "volumeMounts": self.volume_mounts,
        })
    }
}

/// Short-lived container run before the main one.
pub fn init_container(
    name: &str,
    image: &str,
    script: &str,
    resources: Value,
    volume_mounts: Vec<Value>,
) -> Value {
    json!({
        "name": name,
        "image": image,
        "imagePullPolicy": "IfNotPresent",
        "command": ["/bin/sh", "-c"],
        "args": [script],
        "resources": resources,
        "volumeMounts": volume_mounts,
    })
}

/// Everything needed to render a worker pod template.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodTemplate {
    pub name: String,
    pub merged_id: String,
    pub container: ContainerSpec,
    pub init_containers: Vec<Value>,
    pub volumes: Vec<Value>,
    pub grace_period_secs: u64,
    pub affinity: Value,
}

impl PodTemplate {
    fn to_value(&self, restart_never: bool) -> Value {
        let mut spec = json!({
            "initContainers": self.init_containers,
            "containers": [self.container.to_value()],
            "terminationGracePeriodSeconds": self.grace_period_secs,
            "volumes": self.volumes,
            "affinity": self.affinity,
        });
        if restart_never {
            spec["restartPolicy"] = json!("Never");
        }
        json!({
            "metadata": { "labels": labels(&self.name, &self.merged_id) },
            "spec": spec,
        })
    }
}

/// Run-to-completion unit for coordinators and peers.
pub fn job_manifest(namespace: &str, template: &PodTemplate) -> Manifest {
    Manifest {
        kind: ResourceKind::Job,
        name: template.name.clone(),
        body: json!({
            "apiVersion": ResourceKind::Job.api_version(),
            "kind": "Job",
            "metadata": {
                "name": template.name,
                "namespace": namespace,
                "labels": labels(&template.name, &template.merged_id),
            },
            "spec": {
                "backoffLimit": 0,
                "parallelism": 1,
                "template": template.to_value(true),
            }
        }),
    }
}

/// Long-running unit for standby daemons.
pub fn replication_controller_manifest(namespace: &str, template: &PodTemplate) -> Manifest {
    Manifest {
        kind: ResourceKind::ReplicationController,
        name: template.name.clone(),
        body: json!({
            "apiVersion": ResourceKind::ReplicationController.api_version(),
            "kind": "ReplicationController",
            "metadata": {
                "name": template.name,
                "namespace": namespace,
                "labels": labels(&template.name, &template.merged_id),
            },
            "spec": {
                "replicas": 1,
                "selector": { APP_LABEL: template.name },
                "template": template.to_value(false),
            }
        }),
    }
}

pub fn service_manifest(namespace: &str, name: &str, merged_id: &str, ports: &[u16]) -> Manifest {
    let ports: Vec<Value> = ports
        .iter()
        .map(|port| json!({ "port": port, "targetPort": port, "name": format!("{port}-port") }))
        .collect();
    Manifest {
        kind: ResourceKind::Service,
        name: name.to_string(),
        body: json!({
            "apiVersion": ResourceKind::Service.api_version(),
            "kind": "Service",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels(name, merged_id),
            },
            "spec": {
                "selector": { APP_LABEL: name },
                "ports": ports,
            }
        }),
    }
}

pub fn ingress_manifest(
    namespace: &str,
    name: &str,
    merged_id: &str,
    host: &str,
    path: &str,
    port: u16,
) -> Manifest {
    Manifest {
        kind: ResourceKind::Ingress,
        name: name.to_string(),
        body: json!({
            "apiVersion": ResourceKind::Ingress.api_version(),
            "kind": "Ingress",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels(name, merged_id),
                "annotations": {
                    "traefik.frontend.rule.type": "PathPrefix",
                    "kubernetes.io/ingress.class": "traefik",
                },
            },
            "spec": {
                "rules": [{
                    "host": host,
                    "http": {
                        "paths": [{
                            "path": path,
                            "pathType": "Prefix",
                            "backend": {
                                "service": { "name": name, "port": { "number": port } }
                            }
                        }]
                    }
                }]
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PodTemplate {
        PodTemplate {
            name: "u-ns-1-worker-0".into(),
            merged_id: "u-ns-1".into(),
            container: ContainerSpec {
                name: "u-ns-1-worker-0".into(),
                image: "img".into(),
                command: vec!["/bin/bash".into(), "-c".into()],
                args: vec!["python train.py".into()],
                env: vec![("A".into(), "1".into()), ("A".into(), "2".into())],
                ports: vec![2222],
                resources: json!({}),
                volume_mounts: vec![],
            },
            grace_period_secs: 30,
            affinity: json!({}),
            ..Default::default()
        }
    }

    #[test]
    fn test_label_selector_format() {
        let selector = LabelSelector::new().with("jobId", "u-ns-1").with("app", "w");
        assert_eq!(selector.to_string(), "app=w,jobId=u-ns-1");
        assert_eq!(LabelSelector::new().to_string(), "");
    }

    #[test]
    fn test_resources_omit_absent_fields() {
        let request = ResourceRequest {
            cpu: Some(4),
            memory: None,
            gpu: Some(2),
        };
        let value = resources(&request, "nvidia.com/gpu");
        assert_eq!(value["requests"]["cpu"], "4");
        assert_eq!(value["limits"]["nvidia.com/gpu"], "2");
        assert!(value["requests"].get("memory").is_none());

        assert_eq!(resources(&ResourceRequest::default(), "nvidia.com/gpu"), json!({}));
    }

    #[test]
    fn test_job_manifest_shape() {
        let manifest = job_manifest("ns", &template());
        assert_eq!(manifest.kind, ResourceKind::Job);
        assert_eq!(manifest.body["spec"]["backoffLimit"], 0);
        let pod = &manifest.body["spec"]["template"];
        assert_eq!(pod["metadata"]["labels"]["jobId"], "u-ns-1");
        assert_eq!(pod["spec"]["restartPolicy"], "Never");
        assert_eq!(pod["spec"]["containers"][0]["ports"][0]["name"], "2222-port");
        assert_eq!(template().container.env_value("A"), Some("2"));
    }

    #[test]
    fn test_replication_controller_has_no_restart_policy() {
        let manifest = replication_controller_manifest("ns", &template());
        assert_eq!(manifest.body["spec"]["replicas"], 1);
        assert_eq!(manifest.body["spec"]["selector"]["app"], "u-ns-1-worker-0");
        assert!(manifest.body["spec"]["template"]["spec"].get("restartPolicy").is_none());
    }

    #[test]
    fn test_service_and_ingress() {
        let service = service_manifest("ns", "w", "u-ns-1", &[22, 2222]);
        assert_eq!(service.body["spec"]["ports"][1]["targetPort"], 2222);
        assert_eq!(service.body["spec"]["selector"]["app"], "w");

        let ingress = ingress_manifest("ns", "w", "u-ns-1", "tb.example.com", "/", 6006);
        let backend = &ingress.body["spec"]["rules"][0]["http"]["paths"][0]["backend"];
        assert_eq!(backend["service"]["port"]["number"], 6006);
    }
}
