//! Data-parallel ranks: rank 0 hosts the rendezvous, the other ranks wait for
//! it and source its address from a shared env file.

use std::collections::BTreeMap;

use serde_json::json;

use crate::error::AvesError;
use crate::job::{Job, Worker};
use crate::manifest;

use super::{init_resources, role_workers, RenderContext, Topology, WorkerPlan, DEFAULT_PORT};

const ENV_DIR: &str = "/env";
const ENV_VOLUME: &str = "env-sharedir";
const MASTER_ENV_FILE: &str = "/env/master_addr.env";

fn master(workers: &[Worker]) -> Option<&Worker> {
    role_workers(workers, "worker").into_iter().next()
}

fn master_port(workers: &[Worker]) -> u16 {
    master(workers)
        .and_then(|worker| worker.ports.first().copied())
        .unwrap_or(DEFAULT_PORT)
}

pub(super) fn plan(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    let user = format!("{}{}", ctx.user_command(), ctx.data_args);
    if !ctx.job.is_distribute() {
        return Ok(WorkerPlan::runner(Topology::Peer, user));
    }

    let world_size = ctx.role_size("worker");
    let rank = ctx.worker.role_index;
    let port = master_port(ctx.workers);
    let launch = format!("{user} --rank {rank} --world-size {world_size}");

    if rank == 0 {
        let mut envs = host_envs(ctx.job, ctx.workers);
        envs.insert("MASTER_ADDR".into(), "127.0.0.1".into());
        return Ok(WorkerPlan::runner(Topology::Coordinator, launch).with_envs(envs));
    }

    let master_host = master(ctx.workers)
        .map(|worker| worker.host(ctx.namespace()))
        .ok_or_else(|| AvesError::InvalidState("pytorch job has no rank 0 worker".into()))?;
    let max = ctx.config.peer_wait_max_attempts;
    let script = format!(
        "n=0; until nc -z {master_host} {port}; do n=$((n+1)); if [ \"$n\" -ge {max} ]; then echo \"rank 0 not reachable after {max} attempts\" >&2; exit 1; fi; sleep {}; done; echo \"export MASTER_ADDR={master_host}\" > {MASTER_ENV_FILE}",
        ctx.config.peer_wait_interval_secs
    );
    let env_mount = json!({ "name": ENV_VOLUME, "mountPath": ENV_DIR });

    let mut plan = WorkerPlan::runner(
        Topology::Peer,
        format!(". {MASTER_ENV_FILE} ; {launch}"),
    )
    .with_envs(host_envs(ctx.job, ctx.workers));
    plan.init_containers.push(manifest::init_container(
        "prepare-env",
        &ctx.config.wait_image,
        &script,
        init_resources("512Mi"),
        vec![env_mount.clone()],
    ));
    plan.volumes.push(json!({ "name": ENV_VOLUME, "emptyDir": {} }));
    plan.volume_mounts.push(env_mount);
    Ok(plan)
}

pub(super) fn host_envs(job: &Job, workers: &[Worker]) -> BTreeMap<String, String> {
    if !job.is_distribute() {
        return BTreeMap::new();
    }
    BTreeMap::from([("MASTER_PORT".to_string(), master_port(workers).to_string())])
}
