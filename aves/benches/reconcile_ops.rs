//! Benchmarks for event reconciliation.
//!
//! These benchmarks measure:
//! - Event fingerprinting for deduplication
//! - The pure event-to-change mapping
//! - Full `process_event` through leases, locks and the in-memory store

#![allow(missing_docs)]

use std::sync::Arc;

use aves::*;
use aves_testkit::{pod_event, test_config, tf_submission, MockOrchestrator};
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

/// Benchmark: fingerprint a pod event carrying conditions.
fn bench_fingerprint(c: &mut Criterion) {
    let mut event = pod_event("alice-team-1-worker-0-pod01", "team", PodPhase::Running);
    if let WatchEvent::Pod(pod) = &mut event {
        pod.conditions = (0..4)
            .map(|i| PodCondition {
                condition_type: format!("Ready{i}"),
                reason: None,
                last_transition_time: Some(chrono::Utc::now()),
            })
            .collect();
    }

    c.bench_function("event_fingerprint", |b| {
        b.iter(|| criterion::black_box(event.fingerprint()));
    });
}

/// Benchmark: plan a pod update against a 64-worker job.
fn bench_plan(c: &mut Criterion) {
    let mut job = Job::new(tf_submission("1", 2, 64).into_spec().expect("valid"));
    job.status = JobStatus::Running;
    let mut workers = plan_workers(&job, &ResourceDefaults::default());
    for worker in &mut workers {
        worker.status = JobStatus::Running;
    }
    let event = pod_event("alice-team-1-worker-63-pod01", "team", PodPhase::Succeeded);

    c.bench_function("reconcile_plan", |b| {
        b.iter(|| criterion::black_box(reconcile::plan(&job, &workers, &event)));
    });
}

/// Benchmark: deduplicated event processing; after the first iteration
/// every event is a redelivery.
fn bench_process_duplicate(c: &mut Criterion) {
    let rt = create_runtime();
    let controller = Arc::new(
        Controller::builder(test_config())
            .with_store(Arc::new(InMemoryJobStore::new()))
            .with_orchestrator(Arc::new(MockOrchestrator::new()))
            .build()
            .expect("controller builds"),
    );
    rt.block_on(async {
        let job = controller
            .submit(tf_submission("1", 1, 8))
            .await
            .expect("submitted");
        controller.start_job(job.id).await.expect("started");
    });
    let event = pod_event("alice-team-1-worker-3-pod01", "team", PodPhase::Running);

    c.bench_function("process_event_duplicate", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = controller.process_event(&event).await.expect("processed");
            criterion::black_box(outcome);
        });
    });
}

criterion_group!(benches, bench_fingerprint, bench_plan, bench_process_duplicate);
criterion_main!(benches);
