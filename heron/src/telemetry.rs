//! Tracing and telemetry instrumentation for heron.
//!
//! Span constructors for the job lifecycle and `record_*` helpers that log
//! an event and, with the `metrics` feature, update the Prometheus metrics.
//! All helpers work with or without the feature.
//!
//! # Example
//!
//! ```
//! use heron::telemetry::{job_execute_span, record_job_enqueued};
//! use heron::JobId;
//!
//! let span = job_execute_span(JobId(7), "SendEmail", 1);
//! let _enter = span.enter();
//! record_job_enqueued("default", "SendEmail");
//! ```

use tracing::{Span, info_span};
use tracing_subscriber::EnvFilter;

use crate::job::JobId;

/// Install a `tracing-subscriber` fmt layer filtered by `RUST_LOG`, falling
/// back to `default_filter`. Fails if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Span for one handler run.
#[must_use]
pub fn job_execute_span(job_id: JobId, handler: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "heron.execute",
        job_id = %job_id,
        handler = %handler.as_ref(),
        attempt = attempt,
    )
}

/// Span for claiming queued jobs of one pool.
#[must_use]
pub fn job_claim_span(pool: impl AsRef<str>) -> Span {
    info_span!("heron.claim", pool = %pool.as_ref())
}

#[must_use]
pub fn job_enqueue_span(pool: impl AsRef<str>, handler: impl AsRef<str>) -> Span {
    info_span!(
        "heron.enqueue",
        pool = %pool.as_ref(),
        handler = %handler.as_ref(),
    )
}

#[must_use]
pub fn job_callback_span(job_id: JobId, callback: impl AsRef<str>) -> Span {
    info_span!(
        "heron.callback",
        job_id = %job_id,
        callback = %callback.as_ref(),
    )
}

#[must_use]
pub fn task_fire_span(task: impl AsRef<str>) -> Span {
    info_span!("heron.task_fire", task = %task.as_ref())
}

/// Record a job enqueue.
pub fn record_job_enqueued(pool: impl AsRef<str>, handler: impl AsRef<str>) {
    tracing::info!(
        pool = %pool.as_ref(),
        handler = %handler.as_ref(),
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(pool.as_ref(), handler.as_ref());
}

/// Record a job reaching an end state.
///
/// `status` is one of `completed`, `failed`, `cancelled` or
/// `dependency_failed`.
pub fn record_job_finished(
    pool: impl AsRef<str>,
    handler: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_ms: i64,
) {
    tracing::info!(
        pool = %pool.as_ref(),
        handler = %handler.as_ref(),
        status = %status.as_ref(),
        duration_ms,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_job_finished(pool.as_ref(), handler.as_ref(), status.as_ref());
        crate::metrics::observe_job_duration(
            pool.as_ref(),
            handler.as_ref(),
            status.as_ref(),
            duration_ms.max(0) as f64 / 1000.0,
        );
    }
}

/// Record a failed attempt that went back on the queue.
pub fn record_job_retried(
    pool: impl AsRef<str>,
    handler: impl AsRef<str>,
    attempt: u32,
    delay_ms: i64,
) {
    tracing::warn!(
        pool = %pool.as_ref(),
        handler = %handler.as_ref(),
        attempt,
        delay_ms,
        "job attempt failed, retrying"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_retried(pool.as_ref(), handler.as_ref());
}

pub fn record_task_fired(task: impl AsRef<str>) {
    tracing::info!(task = %task.as_ref(), "scheduled task fired");

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_fired(task.as_ref());
}

/// Update the queue depth for a pool.
pub fn set_queue_depth(pool: impl AsRef<str>, depth: usize) {
    tracing::debug!(pool = %pool.as_ref(), depth, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(pool.as_ref(), depth as f64);
}

/// Update pool utilization as a percentage of its limit.
pub fn set_pool_utilization(pool: impl AsRef<str>, running: usize, limit: usize) {
    let utilization = if limit == 0 {
        0.0
    } else {
        running as f64 * 100.0 / limit as f64
    };
    tracing::debug!(pool = %pool.as_ref(), running, limit, "pool utilization updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_pool_utilization(pool.as_ref(), utilization);
    #[cfg(not(feature = "metrics"))]
    let _ = utilization;
}
