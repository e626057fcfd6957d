use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, JobKey, JobStatus};
use crate::manifest::ResourceKind;

/// Metadata envelope attached to every controller event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta<E> {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub entity_id: E,
    pub timestamp: DateTime<Utc>,
}

impl<E> EventMeta<E> {
    pub fn new(
        entity_id: E,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            entity_id,
            timestamp: Utc::now(),
        }
    }
}

/// Something the controller did to a job.
#[derive(Clone, Debug)]
pub struct ControllerEvent {
    pub meta: EventMeta<JobId>,
    pub payload: ControllerEventPayload,
}

impl ControllerEvent {
    pub fn new(job_id: JobId, idempotency_key: impl Into<String>, payload: ControllerEventPayload) -> Self {
        Self {
            meta: EventMeta::new(job_id, None, idempotency_key),
            payload,
        }
    }
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ControllerEventPayload {
    /// Worker records were materialized for the job.
    WorkersMaterialized { key: JobKey, count: usize },
    JobStatusChanged {
        key: JobKey,
        from: JobStatus,
        to: JobStatus,
        message: String,
    },
    WorkerStatusChanged {
        key: JobKey,
        worker: String,
        from: JobStatus,
        to: JobStatus,
    },
    ResourceCreated {
        key: JobKey,
        kind: ResourceKind,
        name: String,
    },
    /// All resources of one worker were removed.
    WorkerStopped { key: JobKey, worker: String },
    /// The event fingerprint was already processed or is in flight.
    EventSkipped { fingerprint: String },
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Multiple subscribers receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers; a subscriber that falls
/// behind the channel capacity receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<ControllerEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher<ControllerEvent> for InProcEventBus {
    async fn publish(&self, event: ControllerEvent) -> anyhow::Result<()> {
        // no subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl EventSubscriber<ControllerEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn skipped(i: usize) -> ControllerEvent {
        ControllerEvent::new(
            JobId::new(),
            format!("skip-{i}"),
            ControllerEventPayload::EventSkipped {
                fingerprint: format!("pod-{i};Running;0;"),
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for i in 0..5 {
            bus.publish(skipped(i)).await.unwrap();
        }

        for _ in 0..5 {
            assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
            assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(skipped(i)).await.unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_)) | Ok(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InProcEventBus::default();
        assert!(bus.publish(skipped(0)).await.is_ok());
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("subscribers: 1"));
        assert!(debug.contains("capacity: 1024"));
    }

    #[test]
    fn test_event_meta_creation() {
        let correlation_id = Uuid::now_v7();
        let meta = EventMeta::new(JobId::new(), Some(correlation_id), "key");
        assert_eq!(meta.version, 1);
        assert_eq!(meta.correlation_id, correlation_id);
        assert_eq!(meta.idempotency_key, "key");
        assert!(meta.timestamp <= Utc::now());
    }
}
