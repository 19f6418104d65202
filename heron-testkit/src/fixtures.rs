use heron::{
    BackgroundJob, BackgroundJobs, BackgroundJobsBuilder, JobId, JobInfo, JobState, JobsConfig,
    JobsResult, RetryConfig,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Config for tests: immediate retries, short ticks and a 1s default timeout.
pub fn fast_config() -> JobsConfig {
    JobsConfig {
        default_timeout_secs: 1,
        tick_interval_ms: 10,
        housekeeper_interval_ms: 50,
        materializer_interval_ms: 10,
        timeout_grace_ms: 50,
        coordinator_max_backoff_ms: 100,
        retry: RetryConfig {
            base_delay_ms: 1,
            max_backoff_ms: 10,
            immediate_retries: 16,
        },
        ..JobsConfig::default()
    }
}

/// An in-memory runtime with [`fast_config`] and the handlers `configure`
/// registers. Background loops are not started; drive it with
/// [`run_until_idle`] or call `start()`.
pub fn memory_runtime(
    configure: impl FnOnce(BackgroundJobsBuilder) -> BackgroundJobsBuilder,
) -> Arc<BackgroundJobs> {
    configure(BackgroundJobsBuilder::new(fast_config()))
        .build()
        .expect("test runtime should build")
}

pub fn command_job(command: &str, body: Value) -> BackgroundJob {
    BackgroundJob::command(command, body)
}

/// Tick the runtime until no job is running and a tick starts nothing new.
pub async fn run_until_idle(runtime: &BackgroundJobs, limit: Duration) -> JobsResult<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let report = runtime.tick().await?;
        let inflight = runtime.dispatcher().inflight();
        if report.started == 0 && report.dependency_failed == 0 && inflight == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("runtime still busy after {limit:?} ({inflight} in flight)");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the job reaches `state` or `limit` passes. End states are
/// only reported once the job has moved out of the live queue.
pub async fn wait_for_state(
    runtime: &BackgroundJobs,
    id: JobId,
    state: JobState,
    limit: Duration,
) -> JobInfo {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let info = runtime.get_job(id).await.expect("job lookup should succeed");
        // end states count once the job is archived
        let current = if state.is_terminal() {
            info.completed.as_ref().or(info.failed.as_ref())
        } else {
            info.queued.as_ref()
        }
        .map(|job| job.state);
        if current == Some(state) {
            return info;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {id} did not reach {state} within {limit:?}; last state {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
