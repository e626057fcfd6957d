use std::collections::BTreeMap;

use aves::*;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Config with fast retries and no report endpoint.
pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.runtime.task_workers = 2;
    config.runtime.task_retry = BackoffConfig {
        base_delay_ms: 5,
        max_delay_ms: 20,
    };
    config.runtime.watch_backoff = BackoffConfig {
        base_delay_ms: 5,
        max_delay_ms: 20,
    };
    config.manifest.peer_wait_interval_secs = 1;
    config.manifest.peer_wait_max_attempts = 3;
    config
}

fn decode(body: Value) -> JobSubmission {
    serde_json::from_value(body).expect("fixture submission decodes")
}

/// TensorFlow parameter-server job: `ps` and `worker` roles.
pub fn tf_submission(job_id: &str, ps: u32, workers: u32) -> JobSubmission {
    decode(json!({
        "jobId": job_id,
        "username": "alice",
        "namespace": "team",
        "engine": "TensorFlow",
        "image": "tf:2",
        "resourceSpec": {
            "ps": { "entryPoint": "python ps.py", "count": ps },
            "worker": {
                "entryPoint": "python train.py",
                "args": ["--lr", "0.1"],
                "nvidia.com/gpu": 1,
                "count": workers
            }
        },
        "inputSpec": { "data": { "type": "HostPath", "path": "/mnt/data" } },
        "outputSpec": { "model": { "type": "HostPath", "path": "/mnt/models" } }
    }))
}

/// PyTorch job with a single `worker` role.
pub fn pytorch_submission(job_id: &str, workers: u32) -> JobSubmission {
    decode(json!({
        "jobId": job_id,
        "username": "bob",
        "namespace": "lab",
        "engine": "PyTorch",
        "image": "pt:2",
        "resourceSpec": {
            "worker": { "entryPoint": "python train.py", "count": workers }
        }
    }))
}

/// Horovod job with one `worker` role.
pub fn horovod_submission(job_id: &str, workers: u32) -> JobSubmission {
    decode(json!({
        "jobId": job_id,
        "username": "carol",
        "namespace": "hpc",
        "engine": "Horovod",
        "image": "hvd:1",
        "resourceSpec": {
            "worker": { "entryPoint": "python train.py", "count": workers, "nvidia.com/gpu": 2 }
        }
    }))
}

/// Attach a required node selector to one role.
pub fn with_selector(
    mut submission: JobSubmission,
    role: &str,
    key: &str,
    values: &[&str],
) -> JobSubmission {
    if let Some(spec) = submission.resource_spec.get_mut(role) {
        spec.schedule_strategy = Some(json!({
            "resourceLevel": {
                "requiredSelector": [
                    { "key": key, "operator": "In", "values": values }
                ]
            }
        }));
    }
    submission
}

/// Pod update for a worker; `name` is usually `<worker>-<suffix>`.
pub fn pod_event(name: &str, namespace: &str, phase: PodPhase) -> WatchEvent {
    WatchEvent::Pod(PodEvent {
        event_type: WatchEventType::Modified,
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::new(),
        phase,
        conditions: Vec::new(),
        waiting_reasons: Vec::new(),
    })
}

/// Pod update with a condition transition at `at`, so redeliveries of the
/// same observation share a fingerprint.
pub fn pod_event_at(name: &str, namespace: &str, phase: PodPhase, at: DateTime<Utc>) -> WatchEvent {
    WatchEvent::Pod(PodEvent {
        event_type: WatchEventType::Modified,
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::new(),
        phase,
        conditions: vec![PodCondition {
            condition_type: "Ready".into(),
            reason: None,
            last_transition_time: Some(at),
        }],
        waiting_reasons: Vec::new(),
    })
}

/// Pending pod whose container cannot pull its image.
pub fn image_pull_event(name: &str, namespace: &str, reason: &str) -> WatchEvent {
    WatchEvent::Pod(PodEvent {
        event_type: WatchEventType::Modified,
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::new(),
        phase: PodPhase::Pending,
        conditions: Vec::new(),
        waiting_reasons: vec![reason.to_string()],
    })
}

/// Warning event on an orchestrator object.
pub fn warning_event(
    kind: &str,
    name: &str,
    namespace: &str,
    reason: &str,
    message: &str,
) -> WatchEvent {
    WatchEvent::Cluster(ClusterEvent {
        involved_object: InvolvedObject {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        severity: EventSeverity::Warning,
        reason: reason.to_string(),
        message: message.to_string(),
        last_timestamp: Some(Utc::now()),
        count: 1,
    })
}
