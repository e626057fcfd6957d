//! Parameter-server topology: `ps` and `worker` both run user code and find
//! each other through `PS_HOSTS` / `WORKER_HOSTS`.

use std::collections::BTreeMap;

use crate::error::AvesError;
use crate::job::{Job, Worker};

use super::{host_list, RenderContext, Topology, WorkerPlan};

pub(super) fn plan(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    let mut command = ctx.user_command();
    if ctx.job.is_distribute() {
        command.push_str(&format!(
            " --ps_hosts ${{PS_HOSTS}} --worker_hosts ${{WORKER_HOSTS}} --job_name {} --task_index {}",
            ctx.worker.role, ctx.worker.role_index
        ));
    }
    command.push_str(ctx.data_args);
    Ok(WorkerPlan::runner(Topology::Peer, command).with_envs(host_envs(ctx.job, ctx.workers)))
}

pub(super) fn host_envs(job: &Job, workers: &[Worker]) -> BTreeMap<String, String> {
    if !job.is_distribute() {
        return BTreeMap::new();
    }
    let namespace = job.namespace();
    BTreeMap::from([
        ("PS_HOSTS".to_string(), host_list(workers, namespace, "ps", None)),
        ("WORKER_HOSTS".to_string(), host_list(workers, namespace, "worker", None)),
    ])
}
