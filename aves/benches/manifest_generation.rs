//! Benchmarks for rendering worker manifests.
//!
//! Measures manifest generation for distributed jobs of increasing size,
//! where each worker's environment lists every peer.

#![allow(missing_docs)]

use aves::*;
use aves_testkit::{horovod_submission, tf_submission};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn prepared(submission: JobSubmission) -> (Job, Vec<Worker>, JobData) {
    let job = Job::new(submission.into_spec().expect("valid submission"));
    let workers = plan_workers(&job, &ResourceDefaults::default());
    let data = JobData::resolve(&job.spec).expect("data resolves");
    (job, workers, data)
}

/// Benchmark: render every worker of a parameter-server job.
fn bench_parameter_server(c: &mut Criterion) {
    let generator = ManifestGenerator::new(ManifestConfig::default());

    let mut group = c.benchmark_group("manifests_parameter_server");
    for workers in [2u32, 16, 64] {
        let (job, planned, data) = prepared(tf_submission("1", 2, workers));
        let storage = strategy_for(&job.spec.storage);
        group.throughput(Throughput::Elements(planned.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &planned, |b, planned| {
            b.iter(|| {
                for worker in planned {
                    let rendered = generator
                        .generate(&job, worker, planned, &data, storage.as_ref())
                        .expect("manifests render");
                    criterion::black_box(rendered);
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: ssh-launched job where the coordinator waits on every peer.
fn bench_coordinator(c: &mut Criterion) {
    let generator = ManifestGenerator::new(ManifestConfig::default());

    let mut group = c.benchmark_group("manifests_coordinator");
    for workers in [2u32, 16, 64] {
        let (job, planned, data) = prepared(horovod_submission("1", workers));
        let storage = strategy_for(&job.spec.storage);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &planned, |b, planned| {
            b.iter(|| {
                let rendered = generator
                    .generate(&job, &planned[0], planned, &data, storage.as_ref())
                    .expect("manifests render");
                criterion::black_box(rendered.into_vec());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parameter_server, bench_coordinator);
criterion_main!(benches);
