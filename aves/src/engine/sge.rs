use std::collections::BTreeMap;

use crate::error::AvesError;
use crate::job::{Job, Worker};

use super::{host_list, RenderContext, Topology, WorkerPlan};

pub(super) fn plan(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    let user = ctx.user_command();
    let command = if ctx.worker.role == "exec" {
        format!("{user} --master_hosts ${{MASTER_HOSTS}} --exec_hosts ${{EXEC_HOSTS}} --role_name exec")
    } else {
        format!(
            "{user} --exec_hosts ${{EXEC_HOSTS}} --master_hosts ${{MASTER_HOSTS}} --role_name master{}",
            ctx.data_args
        )
    };
    Ok(WorkerPlan::runner(Topology::Peer, command).with_envs(host_envs(ctx.job, ctx.workers)))
}

pub(super) fn host_envs(job: &Job, workers: &[Worker]) -> BTreeMap<String, String> {
    let namespace = job.namespace();
    BTreeMap::from([
        (
            "MASTER_HOSTS".to_string(),
            host_list(workers, namespace, "master", None),
        ),
        (
            "EXEC_HOSTS".to_string(),
            host_list(workers, namespace, "exec", None),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn test_roles_get_their_own_flags() {
        let job = job(Engine::Sge, &[("master", 1, None), ("exec", 2, None)]);
        let workers = workers(&job);
        let data = data();
        let config = config();
        let exec = workers.iter().find(|w| w.role == "exec").expect("exec");
        let ctx = RenderContext {
            job: &job,
            worker: exec,
            workers: &workers,
            data: &data,
            data_args: " --data /AVES/data/x",
            config: &config,
        };
        let plan = plan(&ctx).expect("plan");
        assert!(plan.command.ends_with("--role_name exec"));
        let envs: BTreeMap<_, _> = plan.envs.into_iter().collect();
        assert_eq!(
            envs["EXEC_HOSTS"],
            "alice-team-7-exec-0.team:2222,alice-team-7-exec-1.team:2222"
        );
    }
}
