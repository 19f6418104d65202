use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::job::{BackgroundJob, JobError};

/// Computes the delay before retry number `retry` (1-based) using
/// exponential backoff.
///
/// Formula: delay = min(base_delay * 2^(retry - immediate - 1), max_backoff),
/// with the first `immediate_retries` retries running without delay.
pub fn compute_backoff(retry: u32, config: &RetryConfig) -> Duration {
    if retry == 0 || retry <= config.immediate_retries {
        return Duration::zero();
    }

    let exp = (retry - config.immediate_retries - 1).min(62) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);

    Duration::milliseconds(capped.max(0.0) as i64)
}

/// What to do with a job whose attempt just failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RetryDecision {
    /// Put the job back on the queue, runnable from `run_after`.
    Requeue {
        run_after: DateTime<Utc>,
        delay_ms: i64,
    },
    /// Keep the job failed and archive it.
    TerminalFail,
}

/// Routes failed attempts to requeue or terminal failure.
///
/// A job is retried while `attempts <= retry_limit`, so it runs at most
/// `retry_limit + 1` times. Permanent error codes are never retried.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn on_failure(
        &self,
        job: &BackgroundJob,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if error.error_code.is_permanent() || job.attempts > job.retry_limit {
            return RetryDecision::TerminalFail;
        }

        let delay = compute_backoff(job.attempts, &self.config);
        RetryDecision::Requeue {
            run_after: now + delay,
            delay_ms: delay.num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn failed_job(attempts: u32, retry_limit: u32) -> BackgroundJob {
        let mut job = BackgroundJob::command("Flaky", json!({}));
        job.attempts = attempts;
        job.retry_limit = retry_limit;
        job
    }

    #[test]
    fn test_backoff_is_exponential() {
        let config = RetryConfig::default();
        assert_eq!(compute_backoff(1, &config).num_milliseconds(), 1000);
        assert_eq!(compute_backoff(2, &config).num_milliseconds(), 2000);
        assert_eq!(compute_backoff(3, &config).num_milliseconds(), 4000);
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };
        assert_eq!(compute_backoff(10, &config).num_milliseconds(), 5000);
        assert_eq!(compute_backoff(500, &config).num_milliseconds(), 5000);
    }

    #[test]
    fn test_immediate_retries_skip_delay() {
        let config = RetryConfig {
            immediate_retries: 2,
            ..Default::default()
        };
        assert_eq!(compute_backoff(1, &config), Duration::zero());
        assert_eq!(compute_backoff(2, &config), Duration::zero());
        assert_eq!(compute_backoff(3, &config).num_milliseconds(), 1000);
    }

    #[test]
    fn test_retries_until_limit_exhausted() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let error = JobError::new(ErrorCode::ExecutionFailed, "boom");

        // retry_limit 2: attempts 1 and 2 requeue, attempt 3 is final
        assert!(matches!(
            policy.on_failure(&failed_job(1, 2), &error, now),
            RetryDecision::Requeue { .. }
        ));
        assert!(matches!(
            policy.on_failure(&failed_job(2, 2), &error, now),
            RetryDecision::Requeue { .. }
        ));
        assert_eq!(
            policy.on_failure(&failed_job(3, 2), &error, now),
            RetryDecision::TerminalFail
        );
    }

    #[test]
    fn test_requeue_delay_follows_backoff() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let error = JobError::new(ErrorCode::Timeout, "slow");
        match policy.on_failure(&failed_job(2, 5), &error, now) {
            RetryDecision::Requeue { run_after, delay_ms } => {
                assert_eq!(delay_ms, 2000);
                assert_eq!(run_after, now + Duration::milliseconds(2000));
            }
            other => panic!("expected requeue, got {other:?}"),
        }
    }

    #[test]
    fn test_permanent_errors_never_retry() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        for code in [ErrorCode::DependencyFailed, ErrorCode::Cancelled, ErrorCode::NotFound] {
            let error = JobError::new(code, "permanent");
            assert_eq!(
                policy.on_failure(&failed_job(1, 5), &error, now),
                RetryDecision::TerminalFail
            );
        }
    }
}
