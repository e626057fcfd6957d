//! Record store and per-job mutual exclusion.
//!
//! Every state transition on a job and its workers runs while holding the
//! job's [`AggregateGuard`], so a cancel request and a pod-failure event on
//! the same job cannot interleave their read-modify-write cycles.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::AvesError;
use crate::job::{Job, JobId, JobKey, JobStatus, Worker};

/// Persistence for jobs and their workers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fails when a job with the same key already exists.
    async fn insert_job(&self, job: Job) -> anyhow::Result<Job>;

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    async fn find_job(&self, key: &JobKey) -> anyhow::Result<Option<Job>>;

    /// Job owning an orchestrator object name (see [`JobKey::owns_object`]);
    /// the longest owning merged id wins.
    async fn find_job_for_object(&self, object_name: &str) -> anyhow::Result<Option<Job>>;

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: &str,
    ) -> anyhow::Result<()>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>>;

    /// Store the workers of a job atomically. Fails with
    /// [`AvesError::DuplicateMaterialization`] when the job already has
    /// workers, leaving the existing ones untouched.
    async fn insert_workers(&self, job_id: JobId, workers: Vec<Worker>) -> anyhow::Result<()>;

    /// Workers ordered by (role, role_index).
    async fn list_workers(&self, job_id: JobId) -> anyhow::Result<Vec<Worker>>;

    /// Persist status, message, topology and cached manifests of a worker.
    async fn update_worker(&self, worker: &Worker) -> anyhow::Result<()>;

    /// Remove a job and its workers.
    async fn delete_job(&self, id: JobId) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    workers: HashMap<JobId, Vec<Worker>>,
}

/// Process-local store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}

fn sort_workers(workers: &mut [Worker]) {
    workers.sort_by(|a, b| (&a.role, a.role_index).cmp(&(&b.role, b.role_index)));
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: Job) -> anyhow::Result<Job> {
        let mut inner = self.inner.lock();
        if inner.jobs.values().any(|existing| existing.key() == job.key()) {
            return Err(AvesError::validation(format!("job {} already exists", job.key())).into());
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn find_job(&self, key: &JobKey) -> anyhow::Result<Option<Job>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .find(|job| job.key() == key)
            .cloned())
    }

    async fn find_job_for_object(&self, object_name: &str) -> anyhow::Result<Option<Job>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.key().owns_object(object_name))
            .max_by_key(|job| job.merged_id().len())
            .cloned())
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AvesError::NotFound(format!("job {id}")))?;
        job.status = status;
        job.message = message.to_string();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn insert_workers(&self, job_id: JobId, mut workers: Vec<Worker>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get(&job_id)
            .ok_or_else(|| AvesError::NotFound(format!("job {job_id}")))?;
        let merged_id = job.merged_id();
        if inner.workers.get(&job_id).is_some_and(|existing| !existing.is_empty()) {
            return Err(AvesError::DuplicateMaterialization(merged_id).into());
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = workers
            .iter()
            .find(|w| !seen.insert((w.role.clone(), w.role_index)))
        {
            return Err(AvesError::InvalidState(format!(
                "duplicate worker slot {}-{} for job {merged_id}",
                dup.role, dup.role_index
            ))
            .into());
        }
        sort_workers(&mut workers);
        inner.workers.insert(job_id, workers);
        Ok(())
    }

    async fn list_workers(&self, job_id: JobId) -> anyhow::Result<Vec<Worker>> {
        Ok(self
            .inner
            .lock()
            .workers
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .workers
            .get_mut(&worker.job_id)
            .and_then(|workers| workers.iter_mut().find(|w| w.id == worker.id))
            .ok_or_else(|| AvesError::NotFound(format!("worker {}", worker.name)))?;
        *slot = worker.clone();
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.jobs.remove(&id);
        inner.workers.remove(&id);
        Ok(())
    }
}

/// A held lock on one job aggregate.
#[async_trait]
pub trait HeldLock: Send {
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

/// Guard returned by [`AggregateLocker::lock`]; call
/// [`AggregateGuard::release`] when the transition is persisted.
pub struct AggregateGuard {
    job_id: JobId,
    held: Box<dyn HeldLock>,
}

impl fmt::Debug for AggregateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateGuard")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl AggregateGuard {
    pub fn new(job_id: JobId, held: Box<dyn HeldLock>) -> Self {
        Self { job_id, held }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn release(self) -> anyhow::Result<()> {
        self.held.release().await
    }
}

/// Per-job mutual exclusion.
#[async_trait]
pub trait AggregateLocker: Send + Sync {
    /// Wait until the job's lock is free and take it.
    async fn lock(&self, job_id: JobId) -> anyhow::Result<AggregateGuard>;

    /// Drop any per-job state kept for a deleted job.
    fn forget(&self, _job_id: JobId) {}
}

struct InProcHeld {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl HeldLock for InProcHeld {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        drop(self);
        Ok(())
    }
}

/// Locks held in this process only.
#[derive(Debug, Default)]
pub struct InProcAggregateLocker {
    locks: DashMap<JobId, Arc<tokio::sync::Mutex<()>>>,
}

impl InProcAggregateLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[async_trait]
impl AggregateLocker for InProcAggregateLocker {
    async fn lock(&self, job_id: JobId) -> anyhow::Result<AggregateGuard> {
        let mutex = self.locks.entry(job_id).or_default().clone();
        let guard = mutex.lock_owned().await;
        Ok(AggregateGuard::new(job_id, Box::new(InProcHeld { _guard: guard })))
    }

    fn forget(&self, job_id: JobId) {
        self.locks.remove(&job_id);
    }
}
