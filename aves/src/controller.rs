//! Job lifecycle operations.
//!
//! Every operation that changes a job takes the job's aggregate lock first,
//! reloads the job and its workers under it, and only then asks
//! [`crate::state`] and [`crate::reconcile`] what to do. Status writes go
//! through [`Controller::set_job_status`] / [`Controller::set_worker_status`]
//! so that events, metrics and external reports stay in step with the store.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::config::ControllerConfig;
use crate::dataspec::JobData;
use crate::engine::ManifestGenerator;
use crate::error::{AvesError, OrchestratorError, Result};
use crate::events::{ControllerEvent, ControllerEventPayload, EventPublisher, InProcEventBus};
use crate::job::{plan_workers, Job, JobId, JobSpec, JobStatus, Worker};
use crate::lease::{InMemoryLeaseStore, LeaseStore};
use crate::manifest::{LabelSelector, ResourceKind};
use crate::orchestrator::Orchestrator;
use crate::queue::ControlTask;
use crate::reconcile::{self, Reconciliation, WatchEvent};
use crate::report::{HttpStatusReporter, NoopStatusReporter, StatusReport, StatusReporter};
use crate::runtime::{DispatchStatus, TaskDispatcher};
use crate::state::{self, accumulate_message, next_job_status, next_worker_status, Trigger};
use crate::storage::strategy_for;
use crate::store::{AggregateGuard, AggregateLocker, InProcAggregateLocker, JobStore};
use crate::submission::JobSubmission;
use crate::telemetry;

/// Kinds removed for a worker whose created objects are unknown.
const ALL_KINDS: [ResourceKind; 4] = [
    ResourceKind::Ingress,
    ResourceKind::Service,
    ResourceKind::Job,
    ResourceKind::ReplicationController,
];

/// How one watch event was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Status changes were applied.
    Applied,
    /// The event maps to nothing for the job's current state.
    Skipped(String),
    /// The fingerprint was already processed or is being processed.
    Duplicate,
    /// Not an event about a known job.
    Dropped(String),
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Skipped(_) => "skipped",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Dropped(_) => "dropped",
        }
    }
}

/// The reconciliation core: job store, orchestrator and reconciler wired
/// together.
pub struct Controller {
    config: ControllerConfig,
    generator: ManifestGenerator,
    store: Arc<dyn JobStore>,
    orchestrator: Arc<dyn Orchestrator>,
    leases: Arc<dyn LeaseStore>,
    locker: Arc<dyn AggregateLocker>,
    reporter: Arc<dyn StatusReporter>,
    events: Arc<dyn EventPublisher<ControllerEvent>>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Validate a submission and store it as a NEW job.
    pub async fn submit(&self, submission: JobSubmission) -> Result<Job> {
        let spec = submission.into_spec()?;
        self.create_job(spec).await
    }

    pub async fn create_job(&self, spec: JobSpec) -> Result<Job> {
        let job = self
            .store
            .insert_job(Job::new(spec))
            .await
            .map_err(AvesError::from_anyhow)?;
        tracing::info!(job = %job.merged_id(), engine = %job.spec.engine, "job created");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.load_job(job_id).await
    }

    pub async fn workers(&self, job_id: JobId) -> Result<Vec<Worker>> {
        self.store
            .list_workers(job_id)
            .await
            .map_err(AvesError::from_anyhow)
    }

    /// Launch a job that is ready to run.
    ///
    /// Workers are materialized on the first start and reused by re-runs,
    /// which first remove whatever the previous run left behind. Worker
    /// resources are created in order; the first failure stops the launch
    /// and fails the job. Resources created before the failure are left
    /// for a later cancel or clean.
    pub async fn start_job(&self, job_id: JobId) -> Result<()> {
        let guard = self.lock(job_id).await?;
        let result = self.start_locked(job_id).await;
        unlock(guard).await;
        result
    }

    async fn start_locked(&self, job_id: JobId) -> Result<()> {
        let mut job = self.load_job(job_id).await?;
        let span = telemetry::start_span(job.merged_id(), job.spec.engine.as_str());
        async {
            self.set_job_status(&mut job, JobStatus::Starting, "", Trigger::Start)
                .await?;
            match self.launch(&job).await {
                Ok(count) => {
                    telemetry::record_job_started(job.merged_id(), job.spec.engine.as_str(), count);
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(job = %job.merged_id(), error = %err, "job start failed");
                    self.set_job_status(
                        &mut job,
                        JobStatus::Failure,
                        &err.to_string(),
                        Trigger::Operator,
                    )
                    .await?;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn launch(&self, job: &Job) -> Result<usize> {
        let mut workers = self.workers(job.id).await?;
        if workers.is_empty() {
            workers = self.materialize(job).await?;
        } else {
            for worker in &workers {
                self.stop_worker(job, worker).await?;
            }
        }

        let data = JobData::resolve(&job.spec)?;
        let storage = strategy_for(&job.spec.storage);

        for index in 0..workers.len() {
            let rendered =
                self.generator
                    .generate(job, &workers[index], &workers, &data, storage.as_ref())?;
            let topology = rendered.topology;
            let manifests = rendered.into_vec();

            let worker = &mut workers[index];
            worker.topology = topology;
            worker.manifests = manifests.clone();
            self.set_worker_status(job, worker, JobStatus::Starting, "", Trigger::Start)
                .await?;

            for manifest in &manifests {
                self.orchestrator.create(job.namespace(), manifest).await?;
                tracing::debug!(kind = %manifest.kind, name = %manifest.name, "resource created");
                self.publish(ControllerEvent::new(
                    job.id,
                    format!("create-{}-{}", manifest.kind, manifest.name),
                    ControllerEventPayload::ResourceCreated {
                        key: job.key().clone(),
                        kind: manifest.kind,
                        name: manifest.name.clone(),
                    },
                ))
                .await;
            }
        }
        Ok(workers.len())
    }

    /// Materialize the job's workers; fails with
    /// [`AvesError::DuplicateMaterialization`] when they already exist.
    pub async fn make_workers(&self, job_id: JobId) -> Result<Vec<Worker>> {
        let guard = self.lock(job_id).await?;
        let result = match self.load_job(job_id).await {
            Ok(job) => self.materialize(&job).await,
            Err(err) => Err(err),
        };
        unlock(guard).await;
        result
    }

    async fn materialize(&self, job: &Job) -> Result<Vec<Worker>> {
        let workers = plan_workers(job, &self.config.manifest.resources);
        let count = workers.len();
        self.store
            .insert_workers(job.id, workers)
            .await
            .map_err(AvesError::from_anyhow)?;
        tracing::info!(job = %job.merged_id(), count, "workers materialized");
        self.publish(ControllerEvent::new(
            job.id,
            format!("materialize-{}", job.id),
            ControllerEventPayload::WorkersMaterialized {
                key: job.key().clone(),
                count,
            },
        ))
        .await;
        self.workers(job.id).await
    }

    /// Delete every worker's resources and mark the job CANCELED.
    ///
    /// Deletion is attempted for all workers even when some fail; the
    /// failures are joined into one error.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let guard = self.lock(job_id).await?;
        let result = self.cancel_locked(job_id).await;
        unlock(guard).await;
        result
    }

    async fn cancel_locked(&self, job_id: JobId) -> Result<()> {
        let mut job = self.load_job(job_id).await?;
        if job.status == JobStatus::Canceled {
            return Ok(());
        }
        let span = telemetry::cancel_span(job.merged_id());
        async {
            let workers = self.workers(job.id).await?;
            let mut failures = Vec::new();
            for worker in &workers {
                if let Err(err) = self.stop_worker(&job, worker).await {
                    failures.push(format!("{}: {err}", worker.name));
                }
            }
            for mut worker in workers {
                if !worker.status.is_terminal() {
                    self.set_worker_status(
                        &job,
                        &mut worker,
                        JobStatus::Canceled,
                        "",
                        Trigger::Operator,
                    )
                    .await?;
                }
            }

            let message = failures.join("; ");
            self.set_job_status(&mut job, JobStatus::Canceled, &message, Trigger::Operator)
                .await?;
            if failures.is_empty() {
                Ok(())
            } else {
                Err(OrchestratorError::new(None, message).into())
            }
        }
        .instrument(span)
        .await
    }

    /// Stop the job's workers; returns the names of the stopped workers.
    ///
    /// Without `force`, a debug job keeps its primary worker.
    pub async fn clean_work(&self, job_id: JobId, force: bool) -> Result<Vec<String>> {
        let guard = self.lock(job_id).await?;
        let result = async {
            let job = self.load_job(job_id).await?;
            let workers = self.workers(job_id).await?;
            self.clean_locked(&job, &workers, force).await
        }
        .await;
        unlock(guard).await;
        result
    }

    async fn clean_locked(
        &self,
        job: &Job,
        workers: &[Worker],
        force: bool,
    ) -> Result<Vec<String>> {
        let span = telemetry::clean_span(job.merged_id(), force);
        async {
            let mut stopped = Vec::new();
            let mut failures = Vec::new();
            for worker in workers {
                if !force && job.spec.debug && worker.is_primary {
                    tracing::info!(worker = %worker.name, "keeping primary worker of debug job");
                    continue;
                }
                match self.stop_worker(job, worker).await {
                    Ok(()) => stopped.push(worker.name.clone()),
                    Err(err) => failures.push(format!("{}: {err}", worker.name)),
                }
            }
            if failures.is_empty() {
                Ok(stopped)
            } else {
                Err(OrchestratorError::new(None, failures.join("; ")).into())
            }
        }
        .instrument(span)
        .await
    }

    async fn stop_worker(&self, job: &Job, worker: &Worker) -> Result<()> {
        let selector = LabelSelector::for_worker(&worker.name);
        let kinds: Vec<ResourceKind> = if worker.manifests.is_empty() {
            ALL_KINDS.to_vec()
        } else {
            worker.manifests.iter().rev().map(|m| m.kind).collect()
        };
        let mut failures = Vec::new();
        for kind in kinds {
            if let Err(err) = self.orchestrator.delete(kind, job.namespace(), &selector).await {
                tracing::warn!(worker = %worker.name, kind = kind.as_str(), error = %err, "delete failed");
                failures.push((kind, err));
            }
        }
        if let Some((_, first)) = failures.first() {
            let status = first.status;
            let message = failures
                .iter()
                .map(|(kind, err)| format!("delete {}: {err}", kind.as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(OrchestratorError::new(status, message).into());
        }
        tracing::debug!(worker = %worker.name, "worker stopped");
        self.publish(ControllerEvent::new(
            job.id,
            format!("stop-{}", worker.name),
            ControllerEventPayload::WorkerStopped {
                key: job.key().clone(),
                worker: worker.name.clone(),
            },
        ))
        .await;
        Ok(())
    }

    /// External completion report for a RUNNING job, followed by a
    /// non-forced clean.
    pub async fn finish_job(&self, job_id: JobId, status: JobStatus, message: &str) -> Result<()> {
        let guard = self.lock(job_id).await?;
        let result = async {
            let mut job = self.load_job(job_id).await?;
            self.set_job_status(&mut job, status, message, Trigger::Report)
                .await?;
            let workers = self.workers(job_id).await?;
            self.clean_locked(&job, &workers, false).await.map(|_| ())
        }
        .await;
        unlock(guard).await;
        result
    }

    /// Operator status write; returns whether the status changed.
    pub async fn change_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        message: &str,
    ) -> Result<bool> {
        let guard = self.lock(job_id).await?;
        let result = async {
            let mut job = self.load_job(job_id).await?;
            self.set_job_status(&mut job, status, message, Trigger::Operator)
                .await
        }
        .await;
        unlock(guard).await;
        result
    }

    /// Status reported by or for one worker.
    pub async fn change_worker_status(
        &self,
        job_id: JobId,
        worker_name: &str,
        status: JobStatus,
        message: &str,
    ) -> Result<bool> {
        let guard = self.lock(job_id).await?;
        let result = async {
            let job = self.load_job(job_id).await?;
            let mut worker = self
                .workers(job_id)
                .await?
                .into_iter()
                .find(|w| w.name == worker_name)
                .ok_or_else(|| AvesError::NotFound(format!("worker {worker_name}")))?;
            self.set_worker_status(&job, &mut worker, status, message, Trigger::Operator)
                .await
        }
        .await;
        unlock(guard).await;
        result
    }

    /// Peer host lists for a job whose workers are all RUNNING.
    pub async fn distribute_envs(&self, job_id: JobId) -> Result<BTreeMap<String, String>> {
        let job = self.load_job(job_id).await?;
        let workers = self.workers(job_id).await?;
        if workers.is_empty() || workers.iter().any(|w| w.status != JobStatus::Running) {
            return Err(AvesError::InvalidState("workers are not ready".into()));
        }
        Ok(job.spec.engine.host_envs(&job, &workers))
    }

    /// Force-clean the job, then remove its records.
    pub async fn delete_job(&self, job_id: JobId) -> Result<()> {
        let guard = self.lock(job_id).await?;
        let result = async {
            let job = self.load_job(job_id).await?;
            let workers = self.workers(job_id).await?;
            self.clean_locked(&job, &workers, true).await?;
            self.store
                .delete_job(job_id)
                .await
                .map_err(AvesError::from_anyhow)?;
            tracing::info!(job = %job.merged_id(), "job deleted");
            Ok(())
        }
        .await;
        unlock(guard).await;
        if result.is_ok() {
            self.locker.forget(job_id);
        }
        result
    }

    /// Fail jobs stuck in STARTING whose workloads no longer exist.
    pub async fn check_starting_jobs(&self) -> Result<Vec<JobId>> {
        self.expire_starting_jobs(Utc::now()).await
    }

    /// [`Controller::check_starting_jobs`] evaluated at `now`.
    pub async fn expire_starting_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let timeout = chrono::Duration::from_std(std::time::Duration::from_secs(
            self.config.watchdog.starting_timeout_secs,
        ))
        .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - timeout;
        let stale: Vec<JobId> = self
            .store
            .list_jobs_by_status(JobStatus::Starting)
            .await
            .map_err(AvesError::from_anyhow)?
            .into_iter()
            .filter(|job| job.updated_at < cutoff)
            .map(|job| job.id)
            .collect();

        let mut expired = Vec::new();
        for job_id in stale {
            let guard = self.lock(job_id).await?;
            let result = self.expire_starting(job_id, cutoff).await;
            unlock(guard).await;
            match result {
                Ok(true) => expired.push(job_id),
                Ok(false) => {}
                Err(err) => tracing::warn!(%job_id, error = %err, "starting check failed"),
            }
        }
        Ok(expired)
    }

    async fn expire_starting(&self, job_id: JobId, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut job = self.load_job(job_id).await?;
        if job.status != JobStatus::Starting || job.updated_at >= cutoff {
            return Ok(false);
        }
        let selector = LabelSelector::for_job(&job.merged_id());
        for kind in [ResourceKind::Job, ResourceKind::ReplicationController] {
            if !self
                .orchestrator
                .list(kind, job.namespace(), &selector)
                .await?
                .is_empty()
            {
                return Ok(false);
            }
        }

        self.set_job_status(
            &mut job,
            JobStatus::Failure,
            "workers are disappeared",
            Trigger::Event,
        )
        .await?;
        let workers = self.workers(job_id).await?;
        if let Err(err) = self.clean_locked(&job, &workers, true).await {
            tracing::warn!(job = %job.merged_id(), error = %err, "clean after disappearance failed");
        }
        Ok(true)
    }

    /// Apply one watch event at most once per fingerprint.
    ///
    /// Events that do not name a known job are dropped. A fingerprint is
    /// leased before processing; the lease is kept on success so that
    /// redeliveries are skipped, and released on failure so that a retry
    /// can run.
    pub async fn process_event(&self, event: &WatchEvent) -> Result<EventOutcome> {
        let fingerprint = event.fingerprint();
        let span = telemetry::reconcile_span(&fingerprint);
        let outcome = self
            .process_event_inner(event, &fingerprint)
            .instrument(span)
            .await;
        if let Ok(outcome) = &outcome {
            telemetry::record_reconcile_outcome(&fingerprint, outcome.as_str());
        }
        outcome
    }

    async fn process_event_inner(
        &self,
        event: &WatchEvent,
        fingerprint: &str,
    ) -> Result<EventOutcome> {
        let job_ref = match event.job_ref() {
            Ok(job_ref) => job_ref,
            Err(err) => {
                tracing::debug!(%event, error = %err, "event dropped");
                return Ok(EventOutcome::Dropped(err.to_string()));
            }
        };
        let Some(job) = self
            .store
            .find_job_for_object(job_ref)
            .await
            .map_err(AvesError::from_anyhow)?
        else {
            tracing::debug!(%event, job_ref, "event for unknown job dropped");
            return Ok(EventOutcome::Dropped(format!("no job owns {job_ref}")));
        };

        let ttl = self.config.runtime.event_lease_ttl();
        let Some(lease_id) = self
            .leases
            .try_acquire(fingerprint, ttl)
            .await
            .map_err(AvesError::from_anyhow)?
        else {
            self.publish(ControllerEvent::new(
                job.id,
                format!("skip-{fingerprint}"),
                ControllerEventPayload::EventSkipped {
                    fingerprint: fingerprint.to_string(),
                },
            ))
            .await;
            return Ok(EventOutcome::Duplicate);
        };

        let guard = self.lock(job.id).await;
        let result = match guard {
            Ok(guard) => {
                let result = self.reconcile_locked(job.id, event).await;
                unlock(guard).await;
                result
            }
            Err(err) => Err(err),
        };

        let settled = match &result {
            Ok(_) => self.leases.complete(fingerprint, lease_id, ttl).await,
            Err(_) => self.leases.release(fingerprint, lease_id).await,
        };
        if let Err(err) = settled {
            tracing::warn!(fingerprint, error = %err, "event lease update failed");
        }
        result
    }

    async fn reconcile_locked(&self, job_id: JobId, event: &WatchEvent) -> Result<EventOutcome> {
        let mut job = self.load_job(job_id).await?;
        let mut workers = self.workers(job_id).await?;

        let plan = reconcile::plan(&job, &workers, event);
        let (worker_change, job_change, aggregate, mut clean) = match plan {
            Reconciliation::Skip(reason) => {
                tracing::debug!(%event, reason = %reason, "event skipped");
                return Ok(EventOutcome::Skipped(reason));
            }
            Reconciliation::Apply {
                worker,
                job,
                aggregate,
                clean,
            } => (worker, job, aggregate, clean),
        };

        let mut failure = None;
        if let Some(change) = worker_change {
            if let Some(worker) = workers.iter_mut().find(|w| w.name == change.worker) {
                self.set_worker_status(&job, worker, change.status, &change.message, Trigger::Event)
                    .await?;
                if change.status == JobStatus::Failure {
                    failure = Some(change.message);
                }
            }
        }

        if let Some(change) = job_change {
            self.set_job_status(&mut job, change.status, &change.message, Trigger::Event)
                .await?;
        }

        if aggregate {
            if let Some(derived) = state::aggregate(job.status, &workers) {
                let message = match derived.status {
                    JobStatus::Failure => failure
                        .unwrap_or_else(|| format!("{} failed", derived.failed.join(", "))),
                    JobStatus::Finished => "Job finished".to_string(),
                    _ => String::new(),
                };
                let changed = self
                    .set_job_status(&mut job, derived.status, &message, Trigger::Event)
                    .await?;
                if changed && job.status.is_terminal() {
                    clean = clean.or(Some(false));
                }
            }
        }

        if let Some(force) = clean {
            if let Err(err) = self.clean_locked(&job, &workers, force).await {
                tracing::warn!(job = %job.merged_id(), force, error = %err, "clean after event failed");
            }
        }
        Ok(EventOutcome::Applied)
    }

    /// Write a job status through the transition guard; returns whether
    /// anything was written.
    async fn set_job_status(
        &self,
        job: &mut Job,
        requested: JobStatus,
        message: &str,
        trigger: Trigger,
    ) -> Result<bool> {
        let Some(next) = next_job_status(job.status, requested, trigger)? else {
            return Ok(false);
        };
        let message = if trigger == Trigger::Event && next == JobStatus::Failure {
            accumulate_message(&job.message, message)
        } else {
            message.to_string()
        };
        self.store
            .update_job_status(job.id, next, &message)
            .await
            .map_err(AvesError::from_anyhow)?;

        let from = job.status;
        job.status = next;
        job.message = message;
        job.updated_at = Utc::now();
        if from != next {
            telemetry::record_job_transition(job.merged_id(), from.as_str(), next.as_str());
        }

        self.publish(ControllerEvent::new(
            job.id,
            format!("job-{}-{next}", job.id),
            ControllerEventPayload::JobStatusChanged {
                key: job.key().clone(),
                from,
                to: next,
                message: job.message.clone(),
            },
        ))
        .await;
        if job.spec.need_report {
            self.report(
                job,
                StatusReport::job(job.key().job_id.clone(), next, job.message.clone()),
            )
            .await;
        }
        Ok(true)
    }

    async fn set_worker_status(
        &self,
        job: &Job,
        worker: &mut Worker,
        requested: JobStatus,
        message: &str,
        trigger: Trigger,
    ) -> Result<bool> {
        let Some(next) = next_worker_status(worker.status, requested, trigger) else {
            return Ok(false);
        };
        let from = worker.status;
        worker.status = next;
        worker.message = message.to_string();
        self.store
            .update_worker(worker)
            .await
            .map_err(AvesError::from_anyhow)?;
        tracing::debug!(worker = %worker.name, %from, to = %next, "worker status changed");

        self.publish(ControllerEvent::new(
            job.id,
            format!("worker-{}-{next}", worker.name),
            ControllerEventPayload::WorkerStatusChanged {
                key: job.key().clone(),
                worker: worker.name.clone(),
                from,
                to: next,
            },
        ))
        .await;
        if job.spec.need_report {
            self.report(
                job,
                StatusReport::job(job.key().job_id.clone(), next, message)
                    .with_worker(worker.name.clone()),
            )
            .await;
        }
        Ok(true)
    }

    async fn report(&self, job: &Job, report: StatusReport) {
        if let Err(err) = self.reporter.report(report, job.spec.token.clone()).await {
            tracing::warn!(job = %job.merged_id(), error = %err, "status report not queued");
        }
    }

    async fn publish(&self, event: ControllerEvent) {
        if let Err(err) = self.events.publish(event).await {
            tracing::warn!(error = %err, "controller event not published");
        }
    }

    async fn load_job(&self, job_id: JobId) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await
            .map_err(AvesError::from_anyhow)?
            .ok_or_else(|| AvesError::NotFound(format!("job {job_id}")))
    }

    async fn lock(&self, job_id: JobId) -> Result<AggregateGuard> {
        self.locker
            .lock(job_id)
            .await
            .map_err(AvesError::from_anyhow)
    }
}

async fn unlock(guard: AggregateGuard) {
    let job_id = guard.job_id();
    if let Err(err) = guard.release().await {
        tracing::warn!(%job_id, error = %err, "aggregate lock release failed");
    }
}

#[async_trait]
impl TaskDispatcher for Controller {
    async fn dispatch(&self, task: &ControlTask) -> DispatchStatus {
        let result = match task {
            ControlTask::StartJob { job_id } => self.start_job(*job_id).await,
            ControlTask::CancelJob { job_id } => self.cancel_job(*job_id).await,
            ControlTask::ProcessEvent { event } => self.process_event(event).await.map(|_| ()),
        };
        match result {
            Ok(()) => DispatchStatus::Success,
            Err(err) if err.is_retryable() => DispatchStatus::RetryableFailure {
                error: Some(err.to_string()),
            },
            Err(err) => DispatchStatus::PermanentFailure {
                error: Some(err.to_string()),
            },
        }
    }

    async fn housekeep(&self) -> anyhow::Result<()> {
        let expired = self.check_starting_jobs().await?;
        if !expired.is_empty() {
            tracing::warn!("Expired {} jobs stuck in STARTING", expired.len());
        }
        let purged = self.leases.purge_expired().await?;
        if purged > 0 {
            tracing::debug!("Purged {} expired event leases", purged);
        }
        Ok(())
    }
}

/// Builder for [`Controller`].
///
/// The job store and orchestrator are required. Leases and locks default to
/// in-process implementations, the reporter to an HTTP reporter when the
/// config names an endpoint, and events to a fresh [`InProcEventBus`].
pub struct ControllerBuilder {
    config: ControllerConfig,
    store: Option<Arc<dyn JobStore>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    leases: Option<Arc<dyn LeaseStore>>,
    locker: Option<Arc<dyn AggregateLocker>>,
    reporter: Option<Arc<dyn StatusReporter>>,
    events: Option<Arc<dyn EventPublisher<ControllerEvent>>>,
}

impl fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("orchestrator_set", &self.orchestrator.is_some())
            .field("leases_set", &self.leases.is_some())
            .field("locker_set", &self.locker.is_some())
            .field("reporter_set", &self.reporter.is_some())
            .field("events_set", &self.events.is_some())
            .field("builder_type", &type_name::<Self>())
            .finish()
    }
}

impl ControllerBuilder {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            store: None,
            orchestrator: None,
            leases: None,
            locker: None,
            reporter: None,
            events: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_leases(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn with_locker(mut self, locker: Arc<dyn AggregateLocker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher<ControllerEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> anyhow::Result<Controller> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("orchestrator dependency missing"))?;
        let reporter: Arc<dyn StatusReporter> = match self.reporter {
            Some(reporter) => reporter,
            None => match HttpStatusReporter::from_config(&self.config.report)? {
                Some(reporter) => Arc::new(reporter),
                None => Arc::new(NoopStatusReporter),
            },
        };

        Ok(Controller {
            generator: ManifestGenerator::new(self.config.manifest.clone()),
            config: self.config,
            store,
            orchestrator,
            leases: self
                .leases
                .unwrap_or_else(|| Arc::new(InMemoryLeaseStore::new())),
            locker: self
                .locker
                .unwrap_or_else(|| Arc::new(InProcAggregateLocker::new())),
            reporter,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(InProcEventBus::default())),
        })
    }
}
