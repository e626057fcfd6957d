//! Job and worker status transitions.
//!
//! Everything here is pure: callers load the aggregate under its lock, ask
//! these functions what the next status is, and persist the answer. A
//! `None` answer means "leave the record alone", which is how stale or
//! conflicting events are absorbed.

use crate::error::AvesError;
use crate::job::{JobStatus, Worker};

/// Who is asking for a status change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Trigger {
    /// `start`: explicit (re)launch of the job.
    Start,
    /// Reconciled orchestrator event or worker aggregation.
    Event,
    /// External completion report for a running job.
    Report,
    /// Operator or API write, including cancel.
    Operator,
}

/// Next job status for a requested change, or `None` when the request is
/// absorbed without effect.
///
/// FAILURE is sticky against events: only `start` or an operator leaves it.
/// CANCELED ignores every event.
pub fn next_job_status(
    current: JobStatus,
    requested: JobStatus,
    trigger: Trigger,
) -> Result<Option<JobStatus>, AvesError> {
    match trigger {
        Trigger::Start => {
            if !current.is_ready_to_run() {
                return Err(AvesError::InvalidState(format!(
                    "job is {current}, not ready to run"
                )));
            }
            Ok(Some(JobStatus::Starting))
        }
        Trigger::Report => {
            if current != JobStatus::Running {
                return Err(AvesError::InvalidState(format!(
                    "job is {current}, only a running job can be finished"
                )));
            }
            match requested {
                JobStatus::Finished | JobStatus::Failure | JobStatus::Canceled => {
                    Ok(Some(requested))
                }
                other => Err(AvesError::validation(format!(
                    "{other} is not a completion status"
                ))),
            }
        }
        Trigger::Operator => Ok((current != requested).then_some(requested)),
        Trigger::Event => Ok(match (current, requested) {
            (JobStatus::Canceled | JobStatus::Finished | JobStatus::New, _) => None,
            // re-applied so the message can accumulate
            (JobStatus::Failure, JobStatus::Failure) => Some(JobStatus::Failure),
            (JobStatus::Failure, _) => None,
            (_, JobStatus::New | JobStatus::Canceled) => None,
            (current, requested) if current == requested && requested != JobStatus::Starting => {
                None
            }
            (_, requested) => Some(requested),
        }),
    }
}

/// Next worker status; workers only move forward on events and never leave
/// a terminal status except through `start` or an operator.
pub fn next_worker_status(
    current: JobStatus,
    requested: JobStatus,
    trigger: Trigger,
) -> Option<JobStatus> {
    match trigger {
        Trigger::Start => Some(JobStatus::Starting),
        Trigger::Operator | Trigger::Report => (current != requested).then_some(requested),
        Trigger::Event => {
            if current.is_terminal() || current == JobStatus::New || current == requested {
                return None;
            }
            match requested {
                JobStatus::New | JobStatus::Canceled => None,
                JobStatus::Starting | JobStatus::Pending if current == JobStatus::Running => None,
                other => Some(other),
            }
        }
    }
}

/// Append `addition` to a status message, `"; "`-separated.
pub fn accumulate_message(existing: &str, addition: &str) -> String {
    format!("{existing}; {addition}")
        .trim_matches(|c| c == ';' || c == ' ')
        .to_string()
}

/// Job status implied by its workers, for a job that is STARTING or RUNNING.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Aggregate {
    pub status: JobStatus,
    /// Names of failed workers, in worker order.
    pub failed: Vec<String>,
}

/// Derive the job status from worker statuses.
///
/// Any failed worker fails the job. Success needs every worker that runs
/// user code to have finished; standby daemons never exit and are not
/// counted. The job is RUNNING once every worker is running or done.
pub fn aggregate(job_status: JobStatus, workers: &[Worker]) -> Option<Aggregate> {
    if !job_status.is_active() || workers.is_empty() {
        return None;
    }

    let failed: Vec<String> = workers
        .iter()
        .filter(|w| w.status == JobStatus::Failure)
        .map(|w| w.name.clone())
        .collect();
    if !failed.is_empty() {
        return Some(Aggregate {
            status: JobStatus::Failure,
            failed,
        });
    }

    let mut runners = workers.iter().filter(|w| w.topology.runs_user_code()).peekable();
    if runners.peek().is_some() && runners.all(|w| w.status == JobStatus::Finished) {
        return Some(Aggregate {
            status: JobStatus::Finished,
            failed,
        });
    }

    let all_up = workers
        .iter()
        .all(|w| matches!(w.status, JobStatus::Running | JobStatus::Finished));
    (job_status == JobStatus::Starting && all_up).then_some(Aggregate {
        status: JobStatus::Running,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDefaults;
    use crate::engine::test_support::job;
    use crate::engine::{Engine, Topology};
    use crate::job::plan_workers;

    fn workers(engine: Engine, roles: &[(&str, u32, Option<u32>)]) -> Vec<Worker> {
        plan_workers(&job(engine, roles), &ResourceDefaults::default())
    }

    #[test]
    fn test_start_requires_ready_status() {
        for status in [JobStatus::New, JobStatus::Finished, JobStatus::Failure, JobStatus::Canceled] {
            assert_eq!(
                next_job_status(status, JobStatus::Starting, Trigger::Start).ok(),
                Some(Some(JobStatus::Starting))
            );
        }
        assert!(next_job_status(JobStatus::Running, JobStatus::Starting, Trigger::Start).is_err());
    }

    #[test]
    fn test_failure_is_sticky_against_events() {
        let next = next_job_status(JobStatus::Failure, JobStatus::Starting, Trigger::Event);
        assert_eq!(next.ok(), Some(None));
        let next = next_job_status(JobStatus::Failure, JobStatus::Failure, Trigger::Event);
        assert_eq!(next.ok(), Some(Some(JobStatus::Failure)));
        let next = next_job_status(JobStatus::Failure, JobStatus::Running, Trigger::Operator);
        assert_eq!(next.ok(), Some(Some(JobStatus::Running)));
    }

    #[test]
    fn test_canceled_ignores_events() {
        for requested in JobStatus::ALL {
            let next = next_job_status(JobStatus::Canceled, requested, Trigger::Event);
            assert_eq!(next.ok(), Some(None));
        }
    }

    #[test]
    fn test_starting_may_reenter() {
        let next = next_job_status(JobStatus::Starting, JobStatus::Starting, Trigger::Event);
        assert_eq!(next.ok(), Some(Some(JobStatus::Starting)));
        let next = next_job_status(JobStatus::Running, JobStatus::Running, Trigger::Event);
        assert_eq!(next.ok(), Some(None));
    }

    #[test]
    fn test_report_only_for_running_jobs() {
        assert!(next_job_status(JobStatus::Starting, JobStatus::Finished, Trigger::Report).is_err());
        assert!(next_job_status(JobStatus::Running, JobStatus::Pending, Trigger::Report).is_err());
        let next = next_job_status(JobStatus::Running, JobStatus::Finished, Trigger::Report);
        assert_eq!(next.ok(), Some(Some(JobStatus::Finished)));
    }

    #[test]
    fn test_worker_events_move_forward_only() {
        assert_eq!(
            next_worker_status(JobStatus::Starting, JobStatus::Running, Trigger::Event),
            Some(JobStatus::Running)
        );
        assert_eq!(
            next_worker_status(JobStatus::Running, JobStatus::Starting, Trigger::Event),
            None
        );
        assert_eq!(
            next_worker_status(JobStatus::Failure, JobStatus::Finished, Trigger::Event),
            None
        );
        assert_eq!(
            next_worker_status(JobStatus::Finished, JobStatus::Starting, Trigger::Start),
            Some(JobStatus::Starting)
        );
    }

    #[test]
    fn test_message_accumulation() {
        assert_eq!(accumulate_message("", "a-0 failed"), "a-0 failed");
        assert_eq!(accumulate_message("a-0 failed", "a-1 failed"), "a-0 failed; a-1 failed");
    }

    #[test]
    fn test_aggregate_success_needs_all_runners() {
        let mut workers = workers(Engine::TensorFlow, &[("worker", 2, None)]);
        workers[0].status = JobStatus::Finished;
        workers[1].status = JobStatus::Running;
        assert_eq!(aggregate(JobStatus::Running, &workers), None);

        workers[1].status = JobStatus::Finished;
        let agg = aggregate(JobStatus::Running, &workers).expect("aggregate");
        assert_eq!(agg.status, JobStatus::Finished);
        assert_eq!(aggregate(JobStatus::Canceled, &workers), None);
    }

    #[test]
    fn test_aggregate_ignores_standby_workers_for_success() {
        let mut workers = workers(Engine::Horovod, &[("master", 1, None), ("worker", 2, None)]);
        for worker in &mut workers {
            if worker.role == "master" {
                worker.topology = Topology::Coordinator;
                worker.status = JobStatus::Finished;
            } else {
                worker.topology = Topology::Standby;
                worker.status = JobStatus::Running;
            }
        }
        let agg = aggregate(JobStatus::Running, &workers).expect("aggregate");
        assert_eq!(agg.status, JobStatus::Finished);
    }

    #[test]
    fn test_aggregate_failure_and_running() {
        let mut workers = workers(Engine::TensorFlow, &[("ps", 1, None), ("worker", 2, None)]);
        for worker in &mut workers {
            worker.status = JobStatus::Running;
        }
        let agg = aggregate(JobStatus::Starting, &workers).expect("aggregate");
        assert_eq!(agg.status, JobStatus::Running);
        assert_eq!(aggregate(JobStatus::Running, &workers), None);

        workers[2].status = JobStatus::Failure;
        let agg = aggregate(JobStatus::Running, &workers).expect("aggregate");
        assert_eq!(agg.status, JobStatus::Failure);
        assert_eq!(agg.failed, vec![workers[2].name.clone()]);
    }
}
