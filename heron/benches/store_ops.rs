//! Benchmarks for job store and runtime operations using criterion.
//!
//! - Single job enqueue
//! - Claim under contention (several concurrent claimers)
//! - Full lifecycle (enqueue, claim, complete, archive)
//! - Runtime throughput through the dispatcher

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use heron::{ClaimRequest, InMemoryJobStore, JobOptions, JobPatch, JobState, JobStore};
use heron_testkit::{EchoCommand, command_job, memory_runtime, run_until_idle};
use serde_json::json;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

/// Latency of storing one job.
fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let store = Arc::new(InMemoryJobStore::new());
        let job = command_job("Echo", json!({"n": 1}));

        b.to_async(&rt).iter(|| async {
            store
                .enqueue(job.clone())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

/// Claim performance with several claimers racing for the same pool.
fn bench_claim_contention(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("claim_contention");
    group.sample_size(30);

    for claimers in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(200));
        group.bench_with_input(
            BenchmarkId::new("claimers", claimers),
            &claimers,
            |b, &claimers| {
                b.to_async(&rt).iter(|| async move {
                    let store = Arc::new(InMemoryJobStore::new());
                    for i in 0..200 {
                        store
                            .enqueue(command_job("Echo", json!({"i": i})))
                            .await
                            .expect("enqueue should succeed");
                    }

                    let now = Utc::now();
                    let mut handles = Vec::with_capacity(claimers);
                    for _ in 0..claimers {
                        let store = store.clone();
                        handles.push(tokio::spawn(async move {
                            let mut claimed = 0;
                            loop {
                                let outcome = store
                                    .claim_next(ClaimRequest::new("default", 8, now))
                                    .await
                                    .expect("claim should succeed");
                                if outcome.claimed.is_empty() {
                                    break claimed;
                                }
                                claimed += outcome.claimed.len();
                            }
                        }));
                    }

                    let mut total = 0;
                    for handle in handles {
                        total += handle.await.expect("claimer should not panic");
                    }
                    assert_eq!(total, 200);
                });
            },
        );
    }

    group.finish();
}

/// Enqueue, claim, complete and archive one job.
fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let store = Arc::new(InMemoryJobStore::new());

        b.to_async(&rt).iter(|| async {
            let job = store
                .enqueue(command_job("Echo", json!({})))
                .await
                .expect("enqueue should succeed");
            store
                .claim_next(ClaimRequest::new("default", 1, Utc::now()))
                .await
                .expect("claim should succeed");
            store
                .transition(
                    job.id,
                    &[JobState::Started],
                    JobState::Completed,
                    JobPatch::new().response(Some(json!({"ok": true}))),
                )
                .await
                .expect("transition should succeed");
            store
                .move_to_terminal(job.id)
                .await
                .expect("archive should succeed");
        });
    });

    group.finish();
}

/// Jobs per second through enqueue, dispatch, execution and archive.
fn bench_runtime_throughput(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("runtime_throughput");
    group.sample_size(10);

    for jobs in [50usize, 200] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::new("echo", jobs), &jobs, |b, &jobs| {
            b.to_async(&rt).iter(|| async move {
                let runtime = memory_runtime(|b| b.register("Echo", EchoCommand));
                for i in 0..jobs {
                    runtime
                        .enqueue_command("Echo", &json!({"i": i}), JobOptions::new())
                        .await
                        .expect("enqueue should succeed");
                }
                run_until_idle(&runtime, std::time::Duration::from_secs(60))
                    .await
                    .expect("runtime should drain");
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_claim_contention,
    bench_full_lifecycle,
    bench_runtime_throughput
);
criterion_main!(benches);
