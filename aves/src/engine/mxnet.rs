use crate::error::AvesError;

use super::{
    horovod, peer_wait_container, role_workers, RenderContext, Topology, WorkerPlan, SSH_DAEMON,
    SSH_PORT,
};

pub(super) fn plan(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    if ctx.worker.role != "master" {
        return Ok(
            WorkerPlan::standby(SSH_DAEMON).with_envs(horovod::host_envs(ctx.job, ctx.workers))
        );
    }
    let user = format!("{}{}", ctx.user_command(), ctx.data_args);
    if !ctx.job.is_distribute() {
        return Ok(WorkerPlan::runner(Topology::Coordinator, user));
    }

    let namespace = ctx.namespace();
    let peers: Vec<String> = role_workers(ctx.workers, "worker")
        .into_iter()
        .map(|worker| worker.host(namespace))
        .collect();
    let hosts: Vec<String> = role_workers(ctx.workers, "master")
        .into_iter()
        .map(|worker| worker.host(namespace))
        .chain(peers.iter().cloned())
        .collect();
    let count = hosts.len();
    let command = format!(
        "/usr/sbin/sshd ; sleep 3 ; echo -e \"{}\" > /tmp/hosts ; python /mxnet/tools/launch.py -n {count} -s {count} -H /tmp/hosts --launcher ssh {user}",
        hosts.join("\\n")
    );

    let mut plan = WorkerPlan::runner(Topology::Coordinator, command)
        .with_envs(horovod::host_envs(ctx.job, ctx.workers));
    plan.init_containers
        .extend(peer_wait_container(ctx.config, &peers, SSH_PORT));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn test_master_writes_hosts_file_and_launches() {
        let job = job(Engine::Mxnet, &[("master", 1, None), ("worker", 2, None)]);
        let workers = workers(&job);
        let master = workers.iter().find(|w| w.is_primary).expect("primary");
        let data = data();
        let config = config();
        let ctx = RenderContext {
            job: &job,
            worker: master,
            workers: &workers,
            data: &data,
            data_args: "",
            config: &config,
        };
        let plan = plan(&ctx).expect("plan");
        assert_eq!(master.role, "master");
        assert!(plan.command.contains(
            "echo -e \"alice-team-7-master-0.team\\nalice-team-7-worker-0.team\\nalice-team-7-worker-1.team\" > /tmp/hosts"
        ));
        assert!(plan.command.contains("launch.py -n 3 -s 3 -H /tmp/hosts --launcher ssh python train.py"));
        assert_eq!(plan.init_containers.len(), 1);
    }
}
