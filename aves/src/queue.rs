use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::job::JobId;
use crate::reconcile::WatchEvent;

/// The three operations the control plane runs asynchronously.
///
/// Each carries only the key needed to re-fetch current state, so a task is
/// safe to retry and safe to run on any worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ControlTask {
    StartJob { job_id: JobId },
    CancelJob { job_id: JobId },
    ProcessEvent { event: WatchEvent },
}

impl ControlTask {
    pub fn name(&self) -> &'static str {
        match self {
            ControlTask::StartJob { .. } => "start_job",
            ControlTask::CancelJob { .. } => "cancel_job",
            ControlTask::ProcessEvent { .. } => "process_event",
        }
    }
}

impl fmt::Display for ControlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlTask::StartJob { job_id } | ControlTask::CancelJob { job_id } => {
                write!(f, "{}({job_id})", self.name())
            }
            ControlTask::ProcessEvent { event } => write!(f, "{}({event})", self.name()),
        }
    }
}

/// Unique identifier for a queued task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task plus its delivery bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub task: ControlTask,
    /// Completed attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task: ControlTask) -> Self {
        Self {
            id: TaskId::new(),
            task,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The same task after one more failed attempt.
    pub fn retried(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self.enqueued_at = Utc::now();
        self
    }
}

/// Transport for control tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Waits for capacity when the queue is bounded.
    async fn enqueue(&self, envelope: TaskEnvelope) -> anyhow::Result<()>;

    /// Next task, or `None` once the queue is closed and drained.
    async fn dequeue(&self) -> anyhow::Result<Option<TaskEnvelope>>;

    fn depth(&self) -> usize;

    /// Stop accepting tasks; queued tasks can still be dequeued.
    async fn close(&self);
}

/// Bounded in-process queue shared by all task workers.
pub struct InProcTaskQueue {
    sender: Mutex<Option<mpsc::Sender<TaskEnvelope>>>,
    receiver: Mutex<mpsc::Receiver<TaskEnvelope>>,
    capacity: usize,
}

impl fmt::Debug for InProcTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcTaskQueue")
            .field("capacity", &self.capacity)
            .field("depth", &self.depth())
            .finish()
    }
}

impl InProcTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl TaskQueue for InProcTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> anyhow::Result<()> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("task queue is closed"))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("task queue is closed"))
    }

    async fn dequeue(&self) -> anyhow::Result<Option<TaskEnvelope>> {
        Ok(self.receiver.lock().await.recv().await)
    }

    fn depth(&self) -> usize {
        self.sender
            .try_lock()
            .ok()
            .and_then(|sender| {
                sender
                    .as_ref()
                    .map(|s| s.max_capacity() - s.capacity())
            })
            .unwrap_or_default()
    }

    async fn close(&self) {
        self.sender.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_fifo_and_depth() {
        let queue = InProcTaskQueue::new(8);
        let first = JobId::new();
        let second = JobId::new();
        queue
            .enqueue(TaskEnvelope::new(ControlTask::StartJob { job_id: first }))
            .await
            .unwrap();
        queue
            .enqueue(TaskEnvelope::new(ControlTask::CancelJob { job_id: second }))
            .await
            .unwrap();
        assert_eq!(queue.depth(), 2);

        let next = queue.dequeue().await.unwrap().expect("task");
        assert_eq!(next.task, ControlTask::StartJob { job_id: first });
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = InProcTaskQueue::new(2);
        queue
            .enqueue(TaskEnvelope::new(ControlTask::StartJob { job_id: JobId::new() }))
            .await
            .unwrap();
        queue.close().await;

        assert!(queue
            .enqueue(TaskEnvelope::new(ControlTask::StartJob { job_id: JobId::new() }))
            .await
            .is_err());
        assert!(queue.dequeue().await.unwrap().is_some());
        let end = timeout(Duration::from_millis(100), queue.dequeue()).await;
        assert!(matches!(end, Ok(Ok(None))));
    }

    #[test]
    fn test_retried_counts_attempts() {
        let envelope = TaskEnvelope::new(ControlTask::CancelJob { job_id: JobId::new() });
        let id = envelope.id;
        let retried = envelope.retried().retried();
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.id, id);
        assert_eq!(retried.task.name(), "cancel_job");
    }
}
