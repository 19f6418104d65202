//! Heron - background job scheduling and execution.
//!
//! Jobs are stored through a [`JobStore`], claimed atomically by a
//! [`Dispatcher`] within per-pool concurrency budgets, and executed by
//! registered [`CommandHandler`]s under a timeout watchdog. Failed attempts are
//! retried with exponential backoff; recurring work is described by
//! [`ScheduledTask`]s and turned into jobs by the [`Materializer`].
//!
//! # Core Concepts
//!
//! - **Job**: a [`BackgroundJob`] record moving through
//!   `Queued -> Started -> (Executed) -> Completed | Failed | Cancelled`.
//!   Terminal jobs move to month-partitioned completed and failed stores.
//!
//! - **Store**: the [`JobStore`] trait with compare-and-swap transitions.
//!   [`InMemoryJobStore`] is the default; `PostgresJobStore` is available
//!   with the `postgres` feature.
//!
//! - **Dependencies**: a job may depend on another job; it runs only once the
//!   dependency completed and fails with `DependencyFailed` if it never will.
//!
//! - **Runtime**: [`BackgroundJobs`] ties the store, dispatcher, executor,
//!   materializer and housekeeper together and exposes the admin API.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```no_run
//! use heron::{BackgroundJobsBuilder, JobOptions, JobsConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let jobs = BackgroundJobsBuilder::new(JobsConfig::default())
//!     .register_fn("SendEmail", |ctx, payload| async move {
//!         ctx.log(&format!("sending to {}", payload["to"])).await?;
//!         Ok(None)
//!     })
//!     .build()?;
//! jobs.start().await?;
//! jobs.enqueue_command("SendEmail", &json!({"to": "ops@example.com"}), JobOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Per-pool concurrency limits.
///
/// The [`Budget`] trait hands out one [`PoolToken`] per running job;
/// [`InMemoryBudget`] keeps the counters in memory.
pub mod budget;

/// Runtime, retry, pool and persistence configuration.
pub mod config;

/// Scheduled tasks and the materializer that enqueues them.
pub mod cron;

/// Dependency evaluation between jobs.
pub mod dependency;

/// Error types and codes.
pub mod error;

/// Job lifecycle events.
///
/// - [`JobEvent`] and [`JobEventPayload`] for event data
/// - [`EventPublisher`] and [`JobEventStream`] for publishing and subscribing
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Job records, states and options.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Job store implementations.
pub mod persistence;

/// Retry decisions and backoff.
pub mod retry;

/// Runtime: enqueue, execution, cancellation and admin operations.
///
/// - [`BackgroundJobs`] - the runtime
/// - [`BackgroundJobsBuilder`] - constructs it
/// - [`CommandRegistry`] and [`JobContext`] - handler registration and context
/// - [`WorkerExecutor`] - runs a claimed job
pub mod runtime;

/// Dispatch loop that claims due jobs per pool.
pub mod scheduler;

/// The job store trait and the types shared by its implementations.
pub mod store;

/// Tracing spans and metric helpers.
pub mod telemetry;

pub use budget::{Budget, BudgetConfig, InMemoryBudget, PoolToken};
pub use config::{JobsConfig, PersistenceConfig, PoolConfig, RetryConfig};
pub use cron::{FiredTask, Materializer, ScheduledTask, TaskSchedule, parse_cron};
pub use dependency::{DependencyGraph, Eligibility};
pub use error::{ErrorCode, JobsError, JobsResult, Result};
pub use events::{
    EventMeta, EventPublisher, InProcEventBus, JobEvent, JobEventPayload, JobEventStream,
};
pub use job::{
    BackgroundJob, BatchResult, DEFAULT_POOL, DEFAULT_RETRY_LIMIT, FieldError, JobError, JobId,
    JobLocation, JobOptions, JobProgress, JobRef, JobState, JobSummary, MonthKey, RequestKind,
};
pub use persistence::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use persistence::PostgresJobStore;
pub use retry::{RetryDecision, RetryPolicy, compute_backoff};
pub use runtime::{
    BackgroundJobs, BackgroundJobsBuilder, CancelFilter, CancelToken, CommandHandler,
    CommandRegistry, ExecutionOutcome, JobContext, JobInfo, JobLookup, JobStatSummary, JobsInfo,
    WorkerExecutor, WorkerStats,
};
pub use scheduler::{DispatchReport, Dispatcher, DispatcherConfig};
pub use store::{
    ClaimOutcome, ClaimRequest, JobPatch, JobQuery, JobStore, QueueSnapshot, QueueSnapshotEntry,
    Transition,
};
