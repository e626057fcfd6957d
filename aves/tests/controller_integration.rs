//! Controller lifecycle tests against the in-memory store and the mock
//! orchestrator.
//!
//! Covers materialization, launch, event reconciliation, cleaning, cancel
//! and the STARTING watchdog.

use std::sync::Arc;
use std::time::Duration;

use aves::*;
use aves_testkit::{
    horovod_submission, image_pull_event, pod_event, pytorch_submission, test_config,
    tf_submission, warning_event, with_selector, MockOrchestrator, OrchestratorCall, RecordingReporter, StoredObject,
};
use chrono::Utc;
use serde_json::Value;
use tokio::time::timeout;

struct Harness {
    controller: Controller,
    orchestrator: MockOrchestrator,
    reporter: RecordingReporter,
    events: Arc<InProcEventBus>,
}

fn harness() -> Harness {
    let orchestrator = MockOrchestrator::new();
    let reporter = RecordingReporter::new();
    let events = Arc::new(InProcEventBus::default());
    let controller = Controller::builder(test_config())
        .with_store(Arc::new(InMemoryJobStore::new()))
        .with_orchestrator(Arc::new(orchestrator.clone()))
        .with_reporter(Arc::new(reporter.clone()))
        .with_events(events.clone())
        .build()
        .expect("controller builds");
    Harness {
        controller,
        orchestrator,
        reporter,
        events,
    }
}

fn container_env(object: &StoredObject) -> Vec<(String, String)> {
    object.manifest.body["spec"]["template"]["spec"]["containers"][0]["env"]
        .as_array()
        .map(|env| {
            env.iter()
                .filter_map(|item| {
                    Some((
                        item["name"].as_str()?.to_string(),
                        item["value"].as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn env_value(object: &StoredObject, key: &str) -> Option<String> {
    container_env(object)
        .into_iter()
        .rev()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value)
}

async fn start(h: &Harness, submission: JobSubmission) -> Job {
    let job = h.controller.submit(submission).await.expect("submitted");
    h.controller.start_job(job.id).await.expect("started");
    h.controller.get_job(job.id).await.expect("job exists")
}

async fn run_all(h: &Harness, job: &Job) {
    for worker in h.controller.workers(job.id).await.unwrap() {
        let pod = format!("{}-pod01", worker.name);
        h.controller
            .process_event(&pod_event(&pod, job.namespace(), PodPhase::Running))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_make_workers_materializes_role_counts_once() {
    let h = harness();
    let job = h.controller.submit(tf_submission("1", 1, 2)).await.unwrap();

    let workers = h.controller.make_workers(job.id).await.unwrap();
    let names: Vec<&str> = workers.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["alice-team-1-ps-0", "alice-team-1-worker-0", "alice-team-1-worker-1"]
    );

    let err = h.controller.make_workers(job.id).await.unwrap_err();
    assert!(matches!(err, AvesError::DuplicateMaterialization(_)));
    assert_eq!(h.controller.workers(job.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_primary_worker_selection() {
    let h = harness();
    let tf = h.controller.submit(tf_submission("1", 1, 2)).await.unwrap();
    let primaries: Vec<String> = h
        .controller
        .make_workers(tf.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|w| w.is_primary)
        .map(|w| w.name)
        .collect();
    assert_eq!(primaries, vec!["alice-team-1-ps-0".to_string()]);

    let pt = h.controller.submit(pytorch_submission("2", 3)).await.unwrap();
    let primaries: Vec<String> = h
        .controller
        .make_workers(pt.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|w| w.is_primary)
        .map(|w| w.name)
        .collect();
    assert_eq!(primaries, vec!["bob-lab-2-worker-0".to_string()]);
}

#[tokio::test]
async fn test_duplicate_submission_is_rejected() {
    let h = harness();
    h.controller.submit(tf_submission("1", 1, 1)).await.unwrap();
    let err = h.controller.submit(tf_submission("1", 1, 1)).await.unwrap_err();
    assert!(matches!(err, AvesError::Validation(_)));
}

#[tokio::test]
async fn test_start_creates_workload_and_service_per_worker() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 2)).await;
    assert_eq!(job.status, JobStatus::Starting);

    assert_eq!(h.orchestrator.objects_of(ResourceKind::Job).len(), 3);
    assert_eq!(h.orchestrator.objects_of(ResourceKind::Service).len(), 3);

    for worker in h.controller.workers(job.id).await.unwrap() {
        assert_eq!(worker.status, JobStatus::Starting);
        assert!(!worker.manifests.is_empty());
    }

    let worker = h
        .orchestrator
        .object(ResourceKind::Job, "alice-team-1-worker-1")
        .expect("worker job created");
    assert_eq!(worker.labels["jobId"], "alice-team-1");
    let ps_hosts = env_value(&worker, "PS_HOSTS").expect("PS_HOSTS set");
    assert!(ps_hosts.contains("alice-team-1-ps-0.team"));
    let worker_hosts = env_value(&worker, "WORKER_HOSTS").expect("WORKER_HOSTS set");
    assert!(worker_hosts.contains("alice-team-1-worker-0.team"));
    assert!(worker_hosts.contains("alice-team-1-worker-1.team"));
}

#[tokio::test]
async fn test_role_selector_becomes_node_affinity() {
    let h = harness();
    let submission = with_selector(tf_submission("1", 1, 1), "worker", "gpu-type", &["v100"]);
    start(&h, submission).await;

    let worker = h
        .orchestrator
        .object(ResourceKind::Job, "alice-team-1-worker-0")
        .unwrap();
    let expression = &worker.manifest.body["spec"]["template"]["spec"]["affinity"]["nodeAffinity"]
        ["requiredDuringSchedulingIgnoredDuringExecution"]["nodeSelectorTerms"][0]
        ["matchExpressions"][0];
    assert_eq!(expression["key"], "gpu-type");
    assert_eq!(expression["operator"], "In");
    assert_eq!(expression["values"][0], "v100");

    let ps = h
        .orchestrator
        .object(ResourceKind::Job, "alice-team-1-ps-0")
        .unwrap();
    let affinity = &ps.manifest.body["spec"]["template"]["spec"]["affinity"];
    assert_eq!(affinity, &Value::Object(Default::default()));
}

#[tokio::test]
async fn test_pod_lifecycle_finishes_and_cleans_job() {
    let h = harness();
    let job = start(&h, pytorch_submission("1", 1)).await;

    let running = pod_event("bob-lab-1-worker-0-x7k2q", "lab", PodPhase::Running);
    let outcome = h.controller.process_event(&running).await.unwrap();
    assert_eq!(outcome, EventOutcome::Applied);
    assert_eq!(
        h.controller.get_job(job.id).await.unwrap().status,
        JobStatus::Running
    );

    let succeeded = pod_event("bob-lab-1-worker-0-x7k2q", "lab", PodPhase::Succeeded);
    h.controller.process_event(&succeeded).await.unwrap();

    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.message, "Job finished");
    assert!(h.orchestrator.objects().is_empty());
    let workers = h.controller.workers(job.id).await.unwrap();
    assert_eq!(workers[0].status, JobStatus::Finished);
}

#[tokio::test]
async fn test_failed_pod_fails_job_with_worker_message() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 2)).await;
    run_all(&h, &job).await;
    assert_eq!(
        h.controller.get_job(job.id).await.unwrap().status,
        JobStatus::Running
    );

    let failed = pod_event("alice-team-1-worker-1-pod02", "team", PodPhase::Failed);
    h.controller.process_event(&failed).await.unwrap();

    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.message, "alice-team-1-worker-1-pod02 failed");
    assert!(h.orchestrator.objects().is_empty());
}

#[tokio::test]
async fn test_redelivered_event_is_processed_once() {
    let h = harness();
    let job = start(&h, pytorch_submission("1", 1)).await;
    let mut events = h.events.subscribe();

    let running = pod_event("bob-lab-1-worker-0-x7k2q", "lab", PodPhase::Running);
    assert_eq!(
        h.controller.process_event(&running).await.unwrap(),
        EventOutcome::Applied
    );
    assert_eq!(
        h.controller.process_event(&running).await.unwrap(),
        EventOutcome::Duplicate
    );

    let skipped = timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(ControllerEvent {
                    payload: ControllerEventPayload::EventSkipped { fingerprint },
                    ..
                }) => return fingerprint,
                Ok(_) => continue,
                Err(err) => panic!("event bus closed: {err}"),
            }
        }
    })
    .await
    .expect("skip event published");
    assert_eq!(skipped, running.fingerprint());
    assert_eq!(
        h.controller.get_job(job.id).await.unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn test_image_pull_failure_fails_job_and_force_cleans() {
    let h = harness();
    let mut submission = tf_submission("1", 1, 1);
    submission.debug = true;
    let job = start(&h, submission).await;

    let event = image_pull_event("alice-team-1-worker-0-pod01", "team", "ImagePullBackOff");
    h.controller.process_event(&event).await.unwrap();

    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.message, "alice-team-1-worker-0-pod01 ImagePullBackOff");
    // forced: the debug primary is removed too
    assert!(h.orchestrator.objects().is_empty());

    let workers = h.controller.workers(job.id).await.unwrap();
    let worker = workers.iter().find(|w| w.role == "worker").unwrap();
    assert_eq!(worker.status, JobStatus::Failure);
}

#[tokio::test]
async fn test_debug_job_keeps_primary_unless_forced() {
    let h = harness();
    let mut submission = tf_submission("1", 1, 2);
    submission.debug = true;
    let job = start(&h, submission).await;

    let stopped = h.controller.clean_work(job.id, false).await.unwrap();
    assert_eq!(
        stopped,
        vec!["alice-team-1-worker-0".to_string(), "alice-team-1-worker-1".to_string()]
    );
    assert!(h
        .orchestrator
        .object(ResourceKind::Job, "alice-team-1-ps-0")
        .is_some());
    assert!(h
        .orchestrator
        .object(ResourceKind::Job, "alice-team-1-worker-0")
        .is_none());

    let stopped = h.controller.clean_work(job.id, true).await.unwrap();
    assert_eq!(stopped.len(), 3);
    assert!(h.orchestrator.objects().is_empty());
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_blocks_events() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;

    h.controller.cancel_job(job.id).await.unwrap();
    let canceled = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(h.orchestrator.objects().is_empty());
    for worker in h.controller.workers(job.id).await.unwrap() {
        assert_eq!(worker.status, JobStatus::Canceled);
    }

    h.orchestrator.clear_calls();
    h.controller.cancel_job(job.id).await.unwrap();
    assert!(h.orchestrator.calls().is_empty());

    let late = pod_event("alice-team-1-worker-0-pod01", "team", PodPhase::Failed);
    let outcome = h.controller.process_event(&late).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Skipped(_)));
    assert_eq!(
        h.controller.get_job(job.id).await.unwrap().status,
        JobStatus::Canceled
    );
}

#[tokio::test]
async fn test_cancel_collects_delete_failures() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;
    h.orchestrator
        .fail_delete(OrchestratorError::new(Some(500), "apiserver unavailable"));

    let err = h.controller.cancel_job(job.id).await.unwrap_err();
    assert!(matches!(err, AvesError::Orchestrator(_)));

    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.message.contains("alice-team-1-ps-0: delete "));
    assert!(job.message.contains("alice-team-1-worker-0: delete "));
    assert!(job.message.contains("delete Job: apiserver unavailable"));
    assert!(job.message.contains("delete Service: apiserver unavailable"));
}

#[tokio::test]
async fn test_stop_attempts_every_kind_after_a_failed_delete() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;
    h.orchestrator
        .fail_delete_kind(ResourceKind::Service, OrchestratorError::new(Some(500), "apiserver unavailable"));

    let err = h.controller.cancel_job(job.id).await.unwrap_err();
    assert!(matches!(err, AvesError::Orchestrator(_)));

    // workloads are gone even though every service delete failed
    assert!(h.orchestrator.objects_of(ResourceKind::Job).is_empty());
    assert_eq!(h.orchestrator.objects_of(ResourceKind::Service).len(), 2);
    let job_deletes = h
        .orchestrator
        .calls()
        .into_iter()
        .filter(|call| matches!(call, OrchestratorCall::Delete { kind: ResourceKind::Job, .. }))
        .count();
    assert_eq!(job_deletes, 2);

    let job = h.controller.get_job(job.id).await.unwrap();
    assert!(job.message.contains("delete Service: apiserver unavailable"));
    assert!(!job.message.contains("delete Job"));
}

#[tokio::test]
async fn test_start_failure_fails_job_and_rerun_recovers() {
    let h = harness();
    let job = h.controller.submit(tf_submission("1", 1, 1)).await.unwrap();
    h.orchestrator.fail_create_named(
        "alice-team-1-worker-0",
        OrchestratorError::new(Some(422), "Job is invalid"),
    );

    let err = h.controller.start_job(job.id).await.unwrap_err();
    assert!(matches!(err, AvesError::Orchestrator(_)));
    let failed = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failure);
    assert_eq!(failed.message, "Job is invalid");

    h.orchestrator.clear_failures();
    h.controller.start_job(job.id).await.unwrap();
    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Starting);
    assert_eq!(h.orchestrator.objects_of(ResourceKind::Job).len(), 2);
}

#[tokio::test]
async fn test_start_requires_ready_status() {
    let h = harness();
    let job = start(&h, pytorch_submission("1", 1)).await;
    let err = h.controller.start_job(job.id).await.unwrap_err();
    assert!(matches!(err, AvesError::InvalidState(_)));
}

#[tokio::test]
async fn test_finish_requires_running_job() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;

    let err = h
        .controller
        .finish_job(job.id, JobStatus::Finished, "done")
        .await
        .unwrap_err();
    assert!(matches!(err, AvesError::InvalidState(_)));

    run_all(&h, &job).await;
    h.controller
        .finish_job(job.id, JobStatus::Finished, "done")
        .await
        .unwrap();
    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.message, "done");
    assert!(h.orchestrator.objects().is_empty());
}

#[tokio::test]
async fn test_distribute_envs_after_all_workers_run() {
    let h = harness();
    let job = start(&h, horovod_submission("1", 2)).await;

    let err = h.controller.distribute_envs(job.id).await.unwrap_err();
    assert!(matches!(err, AvesError::InvalidState(_)));

    for worker in h.controller.workers(job.id).await.unwrap() {
        h.controller
            .change_worker_status(job.id, &worker.name, JobStatus::Running, "")
            .await
            .unwrap();
    }
    let envs = h.controller.distribute_envs(job.id).await.unwrap();
    let hosts = envs.get("WORKER_HOSTS").expect("worker hosts");
    assert!(hosts.contains("carol-hpc-1-worker-1.hpc"));
}

#[tokio::test]
async fn test_warning_events_accumulate_failure_message() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;
    run_all(&h, &job).await;

    let first = warning_event(
        "Job",
        "alice-team-1-worker-0",
        "team",
        "BackoffLimitExceeded",
        "Job has reached the specified backoff limit",
    );
    let second = warning_event("Pod", "alice-team-1-ps-0-pod01", "team", "FailedMount", "volume missing");
    h.controller.process_event(&first).await.unwrap();
    h.controller.process_event(&second).await.unwrap();

    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(
        job.message,
        "alice-team-1-worker-0: BackoffLimitExceeded: Job has reached the specified backoff limit; \
         alice-team-1-ps-0-pod01: FailedMount: volume missing"
    );
}

#[tokio::test]
async fn test_failed_scheduling_keeps_job_starting() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;

    let event = warning_event(
        "Pod",
        "alice-team-1-worker-0-pod01",
        "team",
        "FailedScheduling",
        "0/3 nodes are available",
    );
    assert_eq!(
        h.controller.process_event(&event).await.unwrap(),
        EventOutcome::Applied
    );
    let job = h.controller.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Starting);
    assert!(job.message.contains("FailedScheduling"));
    assert_eq!(h.orchestrator.objects_of(ResourceKind::Job).len(), 2);
}

#[tokio::test]
async fn test_hyphenated_job_ids_resolve_to_the_owning_job() {
    let h = harness();
    let short = start(&h, pytorch_submission("run", 1)).await;
    let long = start(&h, pytorch_submission("run-1", 1)).await;
    assert_eq!(long.merged_id(), "bob-lab-run-1");
    assert_eq!(long.status, JobStatus::Starting);

    let pod = "bob-lab-run-1-worker-0-x7k2q";
    for (phase, status) in [
        (PodPhase::Running, JobStatus::Running),
        (PodPhase::Succeeded, JobStatus::Finished),
    ] {
        let outcome = h
            .controller
            .process_event(&pod_event(pod, "lab", phase))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied);
        assert_eq!(h.controller.get_job(long.id).await.unwrap().status, status);
    }
    assert_eq!(
        h.controller.get_job(long.id).await.unwrap().message,
        "Job finished"
    );
    assert_eq!(
        h.controller.get_job(short.id).await.unwrap().status,
        JobStatus::Starting
    );

    // the jobId label wins over the pod name
    let mut labelled = pod_event("bob-lab-run-worker-0-abcde", "lab", PodPhase::Running);
    if let WatchEvent::Pod(pod) = &mut labelled {
        pod.labels.insert("jobId".into(), "bob-lab-run".into());
    }
    h.controller.process_event(&labelled).await.unwrap();
    assert_eq!(
        h.controller.get_job(short.id).await.unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn test_unrelated_events_are_dropped() {
    let h = harness();
    start(&h, tf_submission("1", 1, 1)).await;

    let unknown_job = pod_event("mallory-team-9-worker-0-pod01", "team", PodPhase::Failed);
    assert!(matches!(
        h.controller.process_event(&unknown_job).await.unwrap(),
        EventOutcome::Dropped(_)
    ));

    let wrong_kind = warning_event("Node", "alice-team-1", "team", "FailedMount", "");
    assert!(matches!(
        h.controller.process_event(&wrong_kind).await.unwrap(),
        EventOutcome::Dropped(_)
    ));

    let bad_name = pod_event("standalone", "team", PodPhase::Failed);
    assert!(matches!(
        h.controller.process_event(&bad_name).await.unwrap(),
        EventOutcome::Dropped(_)
    ));
}

#[tokio::test]
async fn test_watchdog_fails_jobs_whose_workloads_vanished() {
    let h = harness();
    let vanished = start(&h, tf_submission("1", 1, 1)).await;
    h.orchestrator.remove_all();
    let alive = start(&h, pytorch_submission("2", 1)).await;

    let later = Utc::now() + chrono::Duration::hours(1);
    let expired = h.controller.expire_starting_jobs(later).await.unwrap();
    assert_eq!(expired, vec![vanished.id]);

    let vanished = h.controller.get_job(vanished.id).await.unwrap();
    assert_eq!(vanished.status, JobStatus::Failure);
    assert_eq!(vanished.message, "workers are disappeared");
    assert_eq!(
        h.controller.get_job(alive.id).await.unwrap().status,
        JobStatus::Starting
    );

    // fresh jobs are left alone
    assert!(h.controller.check_starting_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reports_carry_job_token() {
    let h = harness();
    let mut submission = pytorch_submission("1", 1);
    submission.need_report = true;
    submission.token = Some("secret".into());
    let job = start(&h, submission).await;
    h.controller
        .process_event(&pod_event("bob-lab-1-worker-0-pod01", "lab", PodPhase::Running))
        .await
        .unwrap();

    assert_eq!(
        h.reporter.job_statuses(),
        vec![JobStatus::Starting, JobStatus::Running]
    );
    assert!(h
        .reporter
        .tokens()
        .iter()
        .all(|token| token.as_deref() == Some("secret")));
    let worker_reports: Vec<StatusReport> = h
        .reporter
        .reports()
        .into_iter()
        .filter(|r| r.worker.is_some())
        .collect();
    assert!(worker_reports
        .iter()
        .all(|r| r.worker.as_deref() == Some("bob-lab-1-worker-0") && r.job_id == job.key().job_id));
}

#[tokio::test]
async fn test_delete_removes_records_and_resources() {
    let h = harness();
    let job = start(&h, tf_submission("1", 1, 1)).await;

    h.controller.delete_job(job.id).await.unwrap();
    assert!(h.orchestrator.objects().is_empty());
    assert!(matches!(
        h.controller.get_job(job.id).await.unwrap_err(),
        AvesError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_delete_drops_the_job_lock_entry() {
    let locker = Arc::new(InProcAggregateLocker::new());
    let controller = Controller::builder(test_config())
        .with_store(Arc::new(InMemoryJobStore::new()))
        .with_orchestrator(Arc::new(MockOrchestrator::new()))
        .with_locker(locker.clone())
        .build()
        .expect("controller builds");

    let kept = controller.submit(tf_submission("1", 1, 1)).await.unwrap();
    let deleted = controller.submit(tf_submission("2", 1, 1)).await.unwrap();
    controller.start_job(kept.id).await.unwrap();
    controller.start_job(deleted.id).await.unwrap();
    assert_eq!(locker.len(), 2);

    controller.delete_job(deleted.id).await.unwrap();
    assert_eq!(locker.len(), 1);
}

#[tokio::test]
async fn test_housekeeping_purges_expired_event_leases() {
    let mut config = test_config();
    config.runtime.event_lease_ttl_secs = 0;
    let leases = Arc::new(InMemoryLeaseStore::new());
    let controller = Controller::builder(config)
        .with_store(Arc::new(InMemoryJobStore::new()))
        .with_orchestrator(Arc::new(MockOrchestrator::new()))
        .with_leases(leases.clone())
        .build()
        .expect("controller builds");

    let job = controller.submit(tf_submission("1", 1, 1)).await.unwrap();
    controller.start_job(job.id).await.unwrap();
    for worker in controller.workers(job.id).await.unwrap() {
        let pod = format!("{}-pod01", worker.name);
        controller
            .process_event(&pod_event(&pod, job.namespace(), PodPhase::Running))
            .await
            .unwrap();
    }
    assert_eq!(leases.len(), 2);

    tokio::time::sleep(Duration::from_millis(5)).await;
    controller.housekeep().await.unwrap();
    assert!(leases.is_empty());
}

#[tokio::test]
async fn test_concurrent_cancel_and_failure_event_serialize() {
    let h = Arc::new(harness());
    let job = start(&h, tf_submission("1", 1, 2)).await;
    run_all(&h, &job).await;

    let failure = pod_event("alice-team-1-worker-0-pod09", "team", PodPhase::Failed);
    let (cancel, event) = tokio::join!(
        h.controller.cancel_job(job.id),
        h.controller.process_event(&failure)
    );
    cancel.unwrap();
    event.unwrap();

    // whichever ran first, the job ends in exactly one terminal status and
    // every resource is gone
    let job = h.controller.get_job(job.id).await.unwrap();
    assert!(matches!(job.status, JobStatus::Canceled | JobStatus::Failure));
    assert!(h.orchestrator.objects().is_empty());
}
