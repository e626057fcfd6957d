//! Orchestrator watch events and the pure mapping from an event to status
//! changes.
//!
//! The controller owns locking, deduplication and persistence; this module
//! only decides what an event means for a job and its workers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AvesError;
use crate::job::{Job, JobKey, JobStatus, Worker};
use crate::manifest::JOB_LABEL;

/// Involved-object kinds the reconciler accepts.
pub const RECONCILED_KINDS: [&str; 3] = ["Pod", "Job", "ReplicationController"];

/// Waiting reasons that fail a worker without waiting for a terminal phase.
pub const IMAGE_PULL_FAILURES: [&str; 4] = [
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "ErrImageNeverPull",
];

/// Warning reasons that fail the job.
pub const FAILURE_REASONS: [&str; 3] = ["FailedMount", "BackoffLimitExceeded", "FailedCreate"];

pub const FAILED_SCHEDULING: &str = "FailedScheduling";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    pub condition_type: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEvent {
    pub event_type: WatchEventType,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    /// Waiting-state reasons of the pod's containers.
    #[serde(default)]
    pub waiting_reasons: Vec<String>,
}

impl PodEvent {
    /// Most recent condition transition; missing timestamps sort first.
    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        self.conditions
            .iter()
            .map(|condition| condition.last_transition_time)
            .max()
            .flatten()
    }

    pub fn image_pull_failure(&self) -> Option<&str> {
        self.waiting_reasons
            .iter()
            .map(String::as_str)
            .find(|reason| IMAGE_PULL_FAILURES.contains(reason))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedObject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Generic cluster event (the orchestrator's `Event` object).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub involved_object: InvolvedObject,
    pub severity: EventSeverity,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum WatchEvent {
    Pod(PodEvent),
    Cluster(ClusterEvent),
}

impl WatchEvent {
    pub fn object_kind(&self) -> &str {
        match self {
            WatchEvent::Pod(_) => "Pod",
            WatchEvent::Cluster(event) => &event.involved_object.kind,
        }
    }

    pub fn object_name(&self) -> &str {
        match self {
            WatchEvent::Pod(event) => &event.name,
            WatchEvent::Cluster(event) => &event.involved_object.name,
        }
    }

    /// Dedup key: object name, coarse phase, condition count and latest
    /// transition time. Redelivery of the same observation yields the same
    /// key.
    pub fn fingerprint(&self) -> String {
        let stamp = |ts: Option<DateTime<Utc>>| ts.map(|ts| ts.to_rfc3339()).unwrap_or_default();
        match self {
            WatchEvent::Pod(event) => format!(
                "{};{};{};{}",
                event.name,
                event.phase.as_str(),
                event.conditions.len(),
                stamp(event.last_transition())
            ),
            WatchEvent::Cluster(event) => format!(
                "{};{};{};{}",
                event.involved_object.name,
                event.reason,
                event.count,
                stamp(event.last_timestamp)
            ),
        }
    }

    /// Whether the watch loop should forward the event at all.
    pub fn is_actionable(&self) -> bool {
        match self {
            WatchEvent::Pod(event) => event.event_type == WatchEventType::Modified,
            WatchEvent::Cluster(event) => event.severity == EventSeverity::Warning,
        }
    }

    /// Name to resolve the owning job from, rejecting kinds and names this
    /// core does not manage.
    ///
    /// Pods carry the job's merged id as a label; other objects fall back to
    /// their own name.
    pub fn job_ref(&self) -> Result<&str, AvesError> {
        let kind = self.object_kind();
        if !RECONCILED_KINDS.contains(&kind) {
            return Err(AvesError::ReconciliationInput(format!(
                "ignored object kind {kind}"
            )));
        }
        let name = match self {
            WatchEvent::Pod(event) => event
                .labels
                .get(JOB_LABEL)
                .map(String::as_str)
                .unwrap_or(&event.name),
            WatchEvent::Cluster(event) => &event.involved_object.name,
        };
        if !JobKey::is_job_shaped(name) {
            return Err(AvesError::ReconciliationInput(format!(
                "object name {name:?} does not name a job"
            )));
        }
        Ok(name)
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.object_kind(), self.object_name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerChange {
    pub worker: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobChange {
    pub status: JobStatus,
    pub message: String,
}

/// What an event asks of the aggregate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reconciliation {
    /// Nothing to do; the reason is only logged.
    Skip(String),
    Apply {
        worker: Option<WorkerChange>,
        job: Option<JobChange>,
        /// Re-derive the job status from its workers afterwards.
        aggregate: bool,
        /// Clean the job's work; `Some(true)` forces it.
        clean: Option<bool>,
    },
}

impl Reconciliation {
    fn skip(reason: impl Into<String>) -> Self {
        Reconciliation::Skip(reason.into())
    }

    fn worker(name: &str, status: JobStatus, message: String) -> Self {
        Reconciliation::Apply {
            worker: Some(WorkerChange {
                worker: name.to_string(),
                status,
                message,
            }),
            job: None,
            aggregate: true,
            clean: None,
        }
    }

    fn job(status: JobStatus, message: String, clean: Option<bool>) -> Self {
        Reconciliation::Apply {
            worker: None,
            job: Some(JobChange { status, message }),
            aggregate: false,
            clean,
        }
    }
}

/// Map one event onto a loaded job and its workers.
pub fn plan(job: &Job, workers: &[Worker], event: &WatchEvent) -> Reconciliation {
    if job.status == JobStatus::Canceled {
        return Reconciliation::skip("job is canceled");
    }
    match event {
        WatchEvent::Pod(pod) => plan_pod(workers, pod),
        WatchEvent::Cluster(cluster) => plan_cluster(job, cluster),
    }
}

fn plan_pod(workers: &[Worker], pod: &PodEvent) -> Reconciliation {
    let Some(worker) = workers.iter().find(|w| w.owns_object(&pod.name)) else {
        return Reconciliation::skip(format!("no worker owns pod {}", pod.name));
    };
    if !matches!(
        worker.status,
        JobStatus::Starting | JobStatus::Pending | JobStatus::Running
    ) {
        return Reconciliation::skip(format!("worker {} is {}", worker.name, worker.status));
    }

    match pod.phase {
        PodPhase::Succeeded => Reconciliation::worker(&worker.name, JobStatus::Finished, String::new()),
        PodPhase::Failed => Reconciliation::worker(
            &worker.name,
            JobStatus::Failure,
            format!("{} failed", pod.name),
        ),
        PodPhase::Running if worker.status != JobStatus::Running => {
            Reconciliation::worker(&worker.name, JobStatus::Running, String::new())
        }
        PodPhase::Pending => match pod.image_pull_failure() {
            Some(reason) => {
                let message = format!("{} {reason}", pod.name);
                Reconciliation::Apply {
                    worker: Some(WorkerChange {
                        worker: worker.name.clone(),
                        status: JobStatus::Failure,
                        message: message.clone(),
                    }),
                    job: Some(JobChange {
                        status: JobStatus::Failure,
                        message,
                    }),
                    aggregate: false,
                    clean: Some(true),
                }
            }
            None => Reconciliation::skip(format!("pod {} is pending", pod.name)),
        },
        PodPhase::Running | PodPhase::Unknown => {
            Reconciliation::skip(format!("pod {} is {}", pod.name, pod.phase.as_str()))
        }
    }
}

fn plan_cluster(job: &Job, event: &ClusterEvent) -> Reconciliation {
    if event.severity != EventSeverity::Warning {
        return Reconciliation::skip("normal event");
    }
    let reason = event.reason.as_str();
    let failing = FAILURE_REASONS.contains(&reason);
    let message = format!(
        "{}: {reason}: {}",
        event.involved_object.name, event.message
    );

    match job.status {
        JobStatus::Starting | JobStatus::Failure if failing => {
            Reconciliation::job(JobStatus::Failure, message, Some(false))
        }
        JobStatus::Starting | JobStatus::Failure if reason == FAILED_SCHEDULING => {
            Reconciliation::job(JobStatus::Starting, message, None)
        }
        JobStatus::Running if failing => {
            Reconciliation::job(JobStatus::Failure, message, Some(false))
        }
        status => Reconciliation::skip(format!("{reason} while job is {status}")),
    }
}
