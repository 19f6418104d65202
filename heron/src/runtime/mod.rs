/// Runtime builder for constructing [`BackgroundJobs`] instances.
pub mod builder;
/// Cooperative cancellation tokens.
pub mod cancel;
/// Handler execution, timeouts and result settlement.
pub mod executor;
/// Enqueue path shared by the API and the materializer.
pub mod intake;
/// Command handlers and the context passed to them.
pub mod registry;
/// Runtime supervisor: lifecycle, admin and query operations.
pub mod supervisor;
/// Per-pool execution statistics.
pub mod worker;

pub use builder::BackgroundJobsBuilder;
pub use cancel::{CancelRegistry, CancelToken};
pub use executor::{ExecutionOutcome, WorkerExecutor};
pub use intake::JobIntake;
pub use registry::{CommandHandler, CommandRegistry, JobContext};
pub use supervisor::{
    BackgroundJobs, CancelFilter, JobInfo, JobLookup, JobStatSummary, JobsInfo,
};
pub use worker::{AttemptResult, WorkerStats, WorkerStatsRegistry};
