//! Prometheus metrics for heron.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `heron_jobs_enqueued_total` - Jobs stored in the queue
//! - `heron_jobs_finished_total` - Jobs that reached an end state
//! - `heron_jobs_retried_total` - Failed attempts put back on the queue
//! - `heron_tasks_fired_total` - Jobs produced by scheduled tasks
//!
//! ## Gauges
//! - `heron_queue_depth` - Due queued jobs per pool
//! - `heron_pool_utilization` - Running jobs as a percentage of the pool limit
//!
//! ## Histograms
//! - `heron_job_duration_seconds` - Job execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for heron metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `worker`, `command`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("heron_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["worker", "command"])
        .expect("heron_jobs_enqueued_total metric creation failed")
});

/// Labels: `worker`, `command`, `status` (completed, failed, cancelled,
/// dependency_failed).
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "heron_jobs_finished_total",
        "Total number of jobs that reached an end state",
    );
    CounterVec::new(opts, &["worker", "command", "status"])
        .expect("heron_jobs_finished_total metric creation failed")
});

pub static JOBS_RETRIED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("heron_jobs_retried_total", "Total number of retried attempts");
    CounterVec::new(opts, &["worker", "command"])
        .expect("heron_jobs_retried_total metric creation failed")
});

pub static TASKS_FIRED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("heron_tasks_fired_total", "Total number of scheduled task fires");
    CounterVec::new(opts, &["task"]).expect("heron_tasks_fired_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("heron_queue_depth", "Due queued jobs per pool");
    GaugeVec::new(opts, &["worker"]).expect("heron_queue_depth metric creation failed")
});

pub static POOL_UTILIZATION: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "heron_pool_utilization",
        "Running jobs as a percentage of the pool limit (0-100)",
    );
    GaugeVec::new(opts, &["worker"]).expect("heron_pool_utilization metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "heron_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["worker", "command", "status"])
        .expect("heron_job_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_RETRIED_TOTAL.clone()),
        Box::new(TASKS_FIRED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(POOL_UTILIZATION.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric)
            && !matches!(e, prometheus::Error::AlreadyReg)
        {
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn record_job_enqueued(worker: &str, command: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[worker, command]).inc();
}

pub fn record_job_finished(worker: &str, command: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[worker, command, status])
        .inc();
}

pub fn record_job_retried(worker: &str, command: &str) {
    JOBS_RETRIED_TOTAL.with_label_values(&[worker, command]).inc();
}

pub fn record_task_fired(task: &str) {
    TASKS_FIRED_TOTAL.with_label_values(&[task]).inc();
}

pub fn set_queue_depth(worker: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[worker]).set(depth);
}

pub fn set_pool_utilization(worker: &str, utilization: f64) {
    POOL_UTILIZATION.with_label_values(&[worker]).set(utilization);
}

pub fn observe_job_duration(worker: &str, command: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[worker, command, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_enqueued("default", "Echo");
        record_job_finished("default", "Echo", "completed");
        record_job_retried("default", "Echo");
        record_task_fired("nightly");
        set_queue_depth("default", 4.0);
        set_pool_utilization("default", 50.0);
        observe_job_duration("default", "Echo", "completed", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("heron_jobs_enqueued_total"));
        assert!(output.contains("heron_jobs_finished_total"));
        assert!(output.contains("heron_tasks_fired_total"));
        assert!(output.contains("heron_pool_utilization"));
    }
}
