//! All-reduce topology: the master launches `mpiexec` over every host while
//! workers only run sshd.

use std::collections::BTreeMap;

use crate::error::AvesError;
use crate::job::{Job, Worker};

use super::{
    peer_wait_container, role_workers, host_list, RenderContext, Topology, WorkerPlan, SSH_DAEMON,
    SSH_PORT,
};

/// MPI slots for a worker: one per GPU, at least one.
fn slots(worker: &Worker) -> u32 {
    worker.resources.gpu.unwrap_or(0).max(1)
}

fn launch_command(ctx: &RenderContext<'_>) -> String {
    let namespace = ctx.namespace();
    let hosts: Vec<&Worker> = role_workers(ctx.workers, "master")
        .into_iter()
        .chain(role_workers(ctx.workers, "worker"))
        .collect();
    let np: u32 = hosts.iter().map(|worker| slots(worker)).sum();
    let host_slots = hosts
        .iter()
        .map(|worker| format!("{}:{}", worker.host(namespace), slots(worker)))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "/usr/sbin/sshd ; sleep 3 ; mpiexec -np {np} -H {host_slots} --allow-run-as-root -bind-to none -map-by slot -x NCCL_DEBUG=INFO -x LD_LIBRARY_PATH -x PATH -mca plm_rsh_args \"-p {SSH_PORT}\" {}{}",
        ctx.user_command(),
        ctx.data_args
    )
}

pub(super) fn plan(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    if ctx.worker.role != "master" {
        return Ok(WorkerPlan::standby(SSH_DAEMON).with_envs(host_envs(ctx.job, ctx.workers)));
    }
    if !ctx.job.is_distribute() {
        let command = format!("{}{}", ctx.user_command(), ctx.data_args);
        return Ok(WorkerPlan::runner(Topology::Coordinator, command));
    }

    let peers: Vec<String> = role_workers(ctx.workers, "worker")
        .into_iter()
        .map(|worker| worker.host(ctx.namespace()))
        .collect();
    let mut plan = WorkerPlan::runner(Topology::Coordinator, launch_command(ctx))
        .with_envs(host_envs(ctx.job, ctx.workers));
    plan.init_containers
        .extend(peer_wait_container(ctx.config, &peers, SSH_PORT));
    Ok(plan)
}

/// `MASTER_HOSTS` / `WORKER_HOSTS` over the ssh port; shared by every
/// master/worker ssh topology.
pub(super) fn host_envs(job: &Job, workers: &[Worker]) -> BTreeMap<String, String> {
    if !job.is_distribute() {
        return BTreeMap::new();
    }
    let namespace = job.namespace();
    BTreeMap::from([
        (
            "MASTER_HOSTS".to_string(),
            host_list(workers, namespace, "master", Some(SSH_PORT)),
        ),
        (
            "WORKER_HOSTS".to_string(),
            host_list(workers, namespace, "worker", Some(SSH_PORT)),
        ),
    ])
}
