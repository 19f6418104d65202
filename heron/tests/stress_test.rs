//! Stress tests for heron.
//!
//! Runs 1000 jobs across four pools through the background dispatcher loop.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use heron::{BackgroundJobsBuilder, JobOptions, JobQuery, MonthKey, PoolConfig};
use heron_testkit::{FlakyCommand, RecordingCommand, fast_config};
use serde_json::json;
use tokio::time::timeout;

const JOBS: usize = 1000;
const POOLS: [&str; 4] = ["default", "io", "cpu", "mail"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_jobs_complete_exactly_once() {
    let recorder = RecordingCommand::new();
    let mut config = fast_config();
    config.pools = PoolConfig {
        default_max_concurrent: 4,
        ..PoolConfig::default()
    }
    .with_pool("io", 10);

    let runtime = BackgroundJobsBuilder::new(config)
        .register("Record", recorder.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    for i in 0..JOBS {
        let pool = POOLS[i % POOLS.len()];
        runtime
            .enqueue_command("Record", &json!({"i": i}), JobOptions::new().with_worker(pool))
            .await
            .unwrap();
    }

    let month = MonthKey::of(Utc::now());
    let all = JobQuery::all();
    timeout(Duration::from_secs(60), async {
        loop {
            let done = runtime.query_completed(month, &all).await.unwrap().len();
            if done == JOBS {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("all jobs should complete within 60s");

    runtime.shutdown().await.unwrap();

    let calls = recorder.calls();
    assert_eq!(calls.len(), JOBS);
    let unique: HashSet<_> = calls.iter().map(|c| c.job_id).collect();
    assert_eq!(unique.len(), JOBS);
    assert!(runtime.query_jobs(&all).await.unwrap().is_empty());

    let stats = runtime.worker_stats();
    let completed: u64 = stats.iter().map(|s| s.completed).sum();
    assert_eq!(completed as usize, JOBS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retries_under_load_settle_every_job() {
    let flaky = FlakyCommand::new(50);
    let mut config = fast_config();
    config.pools = PoolConfig::default().with_pool("default", 8);

    let runtime = BackgroundJobsBuilder::new(config)
        .register("Flaky", flaky.clone())
        .build()
        .unwrap();

    for i in 0..200 {
        runtime
            .enqueue_command("Flaky", &json!({"i": i}), JobOptions::new().with_retry_limit(5))
            .await
            .unwrap();
    }
    runtime.start().await.unwrap();

    let month = MonthKey::of(Utc::now());
    let all = JobQuery::all();
    timeout(Duration::from_secs(60), async {
        loop {
            let completed = runtime.query_completed(month, &all).await.unwrap().len();
            let failed = runtime.query_failed(month, &all).await.unwrap().len();
            if completed + failed == 200 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("all jobs should settle within 60s");
    runtime.shutdown().await.unwrap();

    // requeued jobs sort behind the backlog, so no job fails twice
    assert_eq!(runtime.query_completed(month, &all).await.unwrap().len(), 200);
    assert_eq!(flaky.calls(), 250);
}
