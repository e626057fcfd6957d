use std::collections::BTreeMap;

use crate::error::AvesError;
use crate::job::{Job, Worker};

use super::{
    gpu_list, peer_wait_container, role_workers, RenderContext, Topology, WorkerPlan, SSH_DAEMON,
    SSH_PORT,
};

fn gpu_suffix(worker: &Worker) -> String {
    gpu_list(worker)
        .map(|gpus| format!(" --gpu {gpus}"))
        .unwrap_or_default()
}

pub(super) fn plan_single(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    let command = format!(
        "{}{}{}",
        ctx.user_command(),
        ctx.data_args,
        gpu_suffix(ctx.worker)
    );
    Ok(WorkerPlan::runner(Topology::Peer, command))
}

pub(super) fn plan_mpi(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    if !ctx.job.is_distribute() {
        return plan_single(ctx);
    }
    let envs = host_envs(ctx.job, ctx.workers);
    if ctx.worker.role_index != 0 {
        return Ok(WorkerPlan::standby(SSH_DAEMON).with_envs(envs));
    }

    let namespace = ctx.namespace();
    let peers: Vec<String> = role_workers(ctx.workers, "worker")
        .into_iter()
        .filter(|worker| worker.role_index != 0)
        .map(|worker| worker.host(namespace))
        .collect();
    let command = format!(
        "/usr/sbin/sshd ; sleep 3 ; mpirun -host $HOSTS -mca btl_openib_want_cuda_gdr 1 -mca io ompio -np {} -npernode 1 -wdir /AVES/src {}{}{}",
        ctx.role_size("worker"),
        ctx.user_command(),
        ctx.data_args,
        gpu_suffix(ctx.worker)
    );
    let mut plan = WorkerPlan::runner(Topology::Coordinator, command).with_envs(envs);
    plan.init_containers
        .extend(peer_wait_container(ctx.config, &peers, SSH_PORT));
    Ok(plan)
}

pub(super) fn host_envs(job: &Job, workers: &[Worker]) -> BTreeMap<String, String> {
    if !job.is_distribute() {
        return BTreeMap::new();
    }
    let hosts = role_workers(workers, "worker")
        .into_iter()
        .map(|worker| worker.host(job.namespace()))
        .collect::<Vec<_>>()
        .join(",");
    BTreeMap::from([("HOSTS".to_string(), hosts)])
}
