use crate::error::AvesError;

use super::{RenderContext, Topology, WorkerPlan};

/// Runs the entrypoint as declared on every worker.
pub(super) fn plan(ctx: &RenderContext<'_>) -> Result<WorkerPlan, AvesError> {
    Ok(WorkerPlan::runner(
        Topology::Peer,
        format!("{}{}", ctx.user_command(), ctx.data_args),
    ))
}
