use std::fmt;

use crate::affinity::affinity_for;
use crate::config::ManifestConfig;
use crate::dataspec::JobData;
use crate::error::AvesError;
use crate::job::{Job, Worker};
use crate::manifest::{
    self, ingress_manifest, job_manifest, replication_controller_manifest, service_manifest,
    ContainerSpec, Manifest, PodTemplate,
};
use crate::storage::StorageStrategy;

use super::{RenderContext, Topology};

/// Orchestrator objects rendered for one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerManifests {
    pub topology: Topology,
    pub workload: Manifest,
    pub service: Option<Manifest>,
    pub ingress: Option<Manifest>,
}

impl WorkerManifests {
    /// Creation order: workload, then service, then ingress.
    pub fn into_vec(self) -> Vec<Manifest> {
        let mut manifests = vec![self.workload];
        manifests.extend(self.service);
        manifests.extend(self.ingress);
        manifests
    }
}

/// Composes an engine plan and a storage strategy into worker manifests.
#[derive(Clone)]
pub struct ManifestGenerator {
    config: ManifestConfig,
}

impl fmt::Debug for ManifestGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestGenerator")
            .field("gpu_resource", &self.config.gpu_resource)
            .finish_non_exhaustive()
    }
}

impl ManifestGenerator {
    pub fn new(config: ManifestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ManifestConfig {
        &self.config
    }

    pub fn generate(
        &self,
        job: &Job,
        worker: &Worker,
        workers: &[Worker],
        data: &JobData,
        storage: &dyn StorageStrategy,
    ) -> Result<WorkerManifests, AvesError> {
        let data_args = storage.data_args(data);
        let ctx = RenderContext {
            job,
            worker,
            workers,
            data,
            data_args: &data_args,
            config: &self.config,
        };
        let plan = job.spec.engine.plan(&ctx)?;

        let mut env = vec![
            ("PYTHONUNBUFFERED".to_string(), "x".to_string()),
            ("JOBID".to_string(), job.merged_id()),
        ];
        env.extend(storage.envs(&ctx));
        env.extend(plan.envs.iter().cloned());
        env.extend(job.spec.envs.iter().map(|(k, v)| (k.clone(), v.clone())));

        let script = match plan.topology {
            Topology::Standby => storage.standby_script(&ctx, &plan.command),
            Topology::Coordinator | Topology::Peer => storage.run_script(&ctx, &plan.command),
        };

        let mut volumes = storage.volumes(&ctx);
        volumes.extend(plan.volumes.iter().cloned());
        let mut volume_mounts = storage.volume_mounts(&ctx);
        volume_mounts.extend(plan.volume_mounts.iter().cloned());

        let role_strategy = job
            .spec
            .resource_spec
            .get(&worker.role)
            .and_then(|spec| spec.schedule_strategy.as_ref());

        let merged_id = job.merged_id();
        let namespace = job.namespace();
        let template = PodTemplate {
            name: worker.name.clone(),
            merged_id: merged_id.clone(),
            container: ContainerSpec {
                name: worker.name.clone(),
                image: job.spec.image.clone(),
                command: vec!["/bin/bash".into(), "-c".into()],
                args: vec![script],
                env,
                ports: worker.ports.clone(),
                resources: manifest::resources(&worker.resources, &self.config.gpu_resource),
                volume_mounts,
            },
            init_containers: plan.init_containers,
            volumes,
            grace_period_secs: storage.grace_period_secs(),
            affinity: affinity_for(role_strategy)?,
        };

        let workload = match plan.topology {
            Topology::Standby => replication_controller_manifest(namespace, &template),
            Topology::Coordinator | Topology::Peer => job_manifest(namespace, &template),
        };
        let service = (!worker.ports.is_empty())
            .then(|| service_manifest(namespace, &worker.name, &merged_id, &worker.ports));
        let ingress = job
            .spec
            .ingress
            .as_ref()
            .filter(|_| worker.is_primary)
            .and_then(|ingress| {
                let port = ingress.port.or_else(|| worker.ports.first().copied())?;
                Some(ingress_manifest(
                    namespace,
                    &worker.name,
                    &merged_id,
                    &ingress.host,
                    &ingress.path,
                    port,
                ))
            });

        Ok(WorkerManifests {
            topology: plan.topology,
            workload,
            service,
            ingress,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::*;
    use super::*;
    use crate::engine::Engine;
    use crate::job::IngressSpec;
    use crate::manifest::ResourceKind;
    use crate::storage::{strategy_for, StorageKind, StorageMode};

    fn env_of(manifest: &Manifest) -> Vec<(String, String)> {
        let pod = match manifest.kind {
            ResourceKind::Job | ResourceKind::ReplicationController => {
                &manifest.body["spec"]["template"]["spec"]["containers"][0]["env"]
            }
            _ => return Vec::new(),
        };
        pod.as_array()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| {
                        (
                            e["name"].as_str().unwrap_or_default().to_string(),
                            e["value"].as_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_tensorflow_worker_renders_job_and_service() {
        let mut job = job(Engine::TensorFlow, &[("ps", 1, None), ("worker", 2, Some(1))]);
        job.spec.envs.insert("JOBID".into(), "override".into());
        let workers = workers(&job);
        let generator = ManifestGenerator::new(config());
        let storage = strategy_for(&job.spec.storage);
        let worker = workers.iter().find(|w| w.role == "worker").expect("worker");

        let out = generator
            .generate(&job, worker, &workers, &data(), storage.as_ref())
            .expect("generate");
        assert_eq!(out.topology, Topology::Peer);
        assert_eq!(out.workload.kind, ResourceKind::Job);
        assert_eq!(out.workload.name, "alice-team-7-worker-0");
        let container = &out.workload.body["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["command"], json!(["/bin/bash", "-c"]));
        assert_eq!(container["resources"]["limits"]["nvidia.com/gpu"], "1");
        let script = container["args"][0].as_str().unwrap_or_default();
        assert!(script.contains("--job_name worker --task_index 0"));

        let env = env_of(&out.workload);
        assert_eq!(env[0], ("PYTHONUNBUFFERED".into(), "x".into()));
        // user envs come last and win
        assert_eq!(env.last().map(|(_, v)| v.as_str()), Some("override"));
        assert!(env.iter().any(|(k, _)| k == "PS_HOSTS"));

        assert!(out.service.is_some());
        assert!(out.ingress.is_none());
        assert_eq!(out.into_vec().len(), 2);
    }

    #[test]
    fn test_standby_worker_renders_replication_controller() {
        let job = job(Engine::Horovod, &[("master", 1, None), ("worker", 1, None)]);
        let workers = workers(&job);
        let generator = ManifestGenerator::new(config());
        let storage = strategy_for(&job.spec.storage);
        let worker = workers.iter().find(|w| w.role == "worker").expect("worker");

        let out = generator
            .generate(&job, worker, &workers, &data(), storage.as_ref())
            .expect("generate");
        assert_eq!(out.topology, Topology::Standby);
        assert_eq!(out.workload.kind, ResourceKind::ReplicationController);
        let service = out.service.expect("ssh service");
        assert_eq!(service.body["spec"]["ports"][0]["port"], 22);
    }

    #[test]
    fn test_ingress_only_on_primary_and_wrapper_grace_period() {
        let mut job = job(Engine::TensorFlow, &[("worker", 2, None)]);
        job.spec.ingress = Some(IngressSpec {
            host: "board.example.com".into(),
            path: "/".into(),
            port: Some(6006),
        });
        job.spec.storage = StorageMode::new(StorageKind::OssFile);
        let workers = workers(&job);
        let generator = ManifestGenerator::new(config());
        let storage = strategy_for(&job.spec.storage);

        let rendered: Vec<WorkerManifests> = workers
            .iter()
            .map(|w| {
                generator
                    .generate(&job, w, &workers, &data(), storage.as_ref())
                    .expect("generate")
            })
            .collect();
        assert_eq!(rendered.iter().filter(|m| m.ingress.is_some()).count(), 1);
        let grace = &rendered[0].workload.body["spec"]["template"]["spec"]
            ["terminationGracePeriodSeconds"];
        assert_eq!(grace, 120);
    }

    #[test]
    fn test_invalid_schedule_strategy_is_rejected() {
        let mut job = job(Engine::TensorFlow, &[("worker", 1, None)]);
        if let Some(spec) = job.spec.resource_spec.get_mut("worker") {
            spec.schedule_strategy = Some(json!({
                "resourceLevel": { "requiredSelector": [{ "key": "zone", "operator": "Near", "values": [] }] }
            }));
        }
        let workers = workers(&job);
        let generator = ManifestGenerator::new(config());
        let storage = strategy_for(&job.spec.storage);
        let result = generator.generate(&job, &workers[0], &workers, &data(), storage.as_ref());
        assert!(matches!(result, Err(AvesError::Validation(_))));
    }
}
