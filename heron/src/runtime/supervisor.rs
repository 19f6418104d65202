use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::JobsConfig;
use crate::cron::{Materializer, ScheduledTask};
use crate::dependency::DependencyGraph;
use crate::error::{ErrorCode, JobsError, JobsResult};
use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{
    BackgroundJob, BatchResult, JobError, JobId, JobLocation, JobOptions, JobProgress, JobRef,
    JobState, JobSummary, MonthKey,
};
use crate::retry::RetryDecision;
use crate::scheduler::{DispatchReport, Dispatcher};
use crate::store::{JobPatch, JobQuery, JobStore, QueueSnapshotEntry, Transition};

use super::cancel::CancelToken;
use super::executor::WorkerExecutor;
use super::intake::JobIntake;
use super::registry::JobContext;
use super::worker::{WorkerStats, WorkerStatsRegistry};

/// Selects jobs to cancel. Explicit ids win; otherwise every live job
/// matching `worker`, `state` and `batch_id` is targeted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelFilter {
    pub ids: Vec<JobId>,
    pub worker: Option<String>,
    pub state: Option<JobState>,
    pub batch_id: Option<String>,
}

impl CancelFilter {
    pub fn ids(ids: impl IntoIterator<Item = JobId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn worker(worker: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.into()),
            ..Self::default()
        }
    }

    pub fn batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Self::default()
        }
    }
}

/// Job lookup key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobLookup {
    Id(JobId),
    RefId(String),
}

impl From<JobId> for JobLookup {
    fn from(id: JobId) -> Self {
        JobLookup::Id(id)
    }
}

impl From<&str> for JobLookup {
    fn from(ref_id: &str) -> Self {
        JobLookup::RefId(ref_id.to_string())
    }
}

impl From<String> for JobLookup {
    fn from(ref_id: String) -> Self {
        JobLookup::RefId(ref_id)
    }
}

/// A job together with its summary; exactly one of the record fields is set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub summary: Option<JobSummary>,
    /// Live record (queued or running).
    pub queued: Option<BackgroundJob>,
    pub completed: Option<BackgroundJob>,
    pub failed: Option<BackgroundJob>,
    /// Live jobs that depend directly on this one, in dispatch order.
    pub dependents: Vec<JobId>,
    /// Unfinished ancestors through `depends_on`, nearest first.
    pub waiting_on: Vec<JobId>,
}

/// Store and pool overview.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsInfo {
    pub month: MonthKey,
    /// Months with archived jobs, newest first.
    pub month_dbs: Vec<MonthKey>,
    pub table_counts: BTreeMap<String, usize>,
    pub completed_in_month: usize,
    pub failed_in_month: usize,
    pub worker_stats: Vec<WorkerStats>,
    pub queue_counts: HashMap<String, QueueSnapshotEntry>,
}

/// Job counts for one command, pool and state over a date range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatSummary {
    pub command: String,
    pub worker: String,
    pub state: JobState,
    pub count: usize,
    pub total_duration_ms: i64,
}

/// Background job runtime: accepts jobs, runs them through the dispatcher and
/// exposes the query and admin operations.
pub struct BackgroundJobs {
    config: JobsConfig,
    store: Arc<dyn JobStore>,
    events: Arc<InProcEventBus>,
    intake: Arc<JobIntake>,
    executor: Arc<WorkerExecutor>,
    dispatcher: Arc<Dispatcher>,
    materializer: Arc<Materializer>,
    stats: Arc<WorkerStatsRegistry>,
    shutdown_token: CancelToken,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackgroundJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobs")
            .field("config", &self.config)
            .field("events", &self.events)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BackgroundJobs {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: JobsConfig,
        store: Arc<dyn JobStore>,
        events: Arc<InProcEventBus>,
        intake: Arc<JobIntake>,
        executor: Arc<WorkerExecutor>,
        dispatcher: Arc<Dispatcher>,
        materializer: Arc<Materializer>,
        stats: Arc<WorkerStatsRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            intake,
            executor,
            dispatcher,
            materializer,
            stats,
            shutdown_token: CancelToken::new(),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        self.events.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn materializer(&self) -> Arc<Materializer> {
        self.materializer.clone()
    }

    /// Recover work left by a previous process, then spawn the dispatcher,
    /// housekeeper and materializer loops.
    pub async fn start(self: &Arc<Self>) -> JobsResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let recovered = self.recover().await?;
        tracing::info!(recovered, "starting background jobs runtime");

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(
            self.dispatcher.clone().run(self.shutdown_token.clone()),
        ));
        handles.push(tokio::spawn(self.materializer.clone().run(
            Duration::from_millis(self.config.materializer_interval_ms),
            self.shutdown_token.clone(),
        )));
        handles.push(self.spawn_housekeeper());
        Ok(())
    }

    /// Gracefully stop all loops and wait for running jobs.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of background jobs runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        match tokio::time::timeout(Duration::from_secs(30), join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!("Runtime task failed: {:?}", e);
                    }
                }
            }
            Err(_) => tracing::warn!("Runtime tasks timed out during shutdown"),
        }

        tracing::info!("Background jobs runtime shutdown complete");
        Ok(())
    }

    fn spawn_housekeeper(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let interval = Duration::from_millis(self.config.housekeeper_interval_ms);
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = runtime.housekeep(Utc::now()).await {
                            tracing::warn!("housekeeper error: {err}");
                        }
                    }
                }
            }
        })
    }

    /// Fail `Started` jobs that outlived their timeout plus grace and are not
    /// running in this process, and settle jobs whose final write was lost.
    /// Returns how many jobs were touched.
    pub async fn housekeep(&self, now: DateTime<Utc>) -> JobsResult<usize> {
        let settled = self.settle_leftovers(now).await?;
        Ok(settled + self.expire_abandoned(now).await?)
    }

    async fn expire_abandoned(&self, now: DateTime<Utc>) -> JobsResult<usize> {
        let grace = chrono::Duration::milliseconds(self.config.timeout_grace_ms as i64);
        let mut expired = 0;
        for job in self.store.started_jobs().await? {
            if job.state != JobState::Started || self.executor.cancels().is_running(job.id) {
                continue;
            }
            let timeout_secs = self.executor.timeout_secs(&job);
            let Some(started) = job.started_date else {
                continue;
            };
            if started + chrono::Duration::seconds(timeout_secs as i64) + grace > now {
                continue;
            }
            tracing::warn!(job_id = %job.id, timeout_secs, "re-delivering abandoned job");
            let error = JobError::new(
                ErrorCode::Timeout,
                format!("no result within {timeout_secs}s; runner lost"),
            );
            if self.executor.fail_job(&job, error).await?.is_some() {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Live jobs that already reached a final state, or failed with retries
    /// left but were never requeued, because a store write failed. Jobs
    /// touched within the grace period belong to whoever is settling them.
    async fn settle_leftovers(&self, now: DateTime<Utc>) -> JobsResult<usize> {
        let grace = chrono::Duration::milliseconds(self.config.timeout_grace_ms as i64);
        let mut settled = 0;
        for job in self.store.query_live(&JobQuery::all()).await? {
            if job.last_activity_date + grace > now || self.executor.cancels().is_running(job.id) {
                continue;
            }
            let finished = match job.state {
                JobState::Completed | JobState::Cancelled => true,
                JobState::Failed => match &job.error {
                    Some(error) => matches!(
                        self.executor.retry().on_failure(&job, error, now),
                        RetryDecision::TerminalFail
                    ),
                    None => true,
                },
                _ => continue,
            };

            if finished {
                let archived = self.store.move_to_terminal(job.id).await?;
                tracing::warn!(job_id = %job.id, state = %archived.state, "archived leftover job");
            } else {
                let patch = JobPatch::new().run_after(now).log("requeued by housekeeper");
                if self
                    .store
                    .transition(job.id, &[JobState::Failed], JobState::Queued, patch)
                    .await?
                    .applied()
                    .is_none()
                {
                    continue;
                }
                tracing::warn!(job_id = %job.id, "requeued leftover failed job");
                self.dispatcher.wake();
            }
            settled += 1;
        }
        Ok(settled)
    }

    /// Settle jobs a previous process left running: `Started` attempts are
    /// failed and retried, `Executed` jobs complete and get their callback.
    /// Jobs completed this month whose callback never confirmed are notified
    /// again.
    async fn recover(&self) -> JobsResult<usize> {
        let mut recovered = 0;
        for job in self.store.started_jobs().await? {
            if self.executor.cancels().is_running(job.id) {
                continue;
            }
            match job.state {
                JobState::Started => {
                    let error =
                        JobError::new(ErrorCode::Timeout, "interrupted by runtime restart");
                    self.executor.fail_job(&job, error).await?;
                }
                JobState::Executed => self.executor.complete_executed(job).await?,
                _ => continue,
            }
            recovered += 1;
        }

        let month = MonthKey::of(Utc::now());
        for job in self.store.query_completed(month, &JobQuery::all()).await? {
            // a callback that already gave up is not retried
            let pending = job.callback.as_deref().is_some_and(|callback| {
                job.notified_date.is_none()
                    && !job.logs.contains(&format!("callback '{callback}' failed"))
            });
            if pending {
                self.executor.spawn_callback(job);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Run one materializer pass and one dispatcher pass now.
    pub async fn tick(&self) -> JobsResult<DispatchReport> {
        let now = Utc::now();
        self.materializer.tick(now).await?;
        self.dispatcher.tick(now).await
    }

    pub async fn enqueue(
        &self,
        job: BackgroundJob,
        options: JobOptions,
    ) -> JobsResult<BackgroundJob> {
        self.intake.submit(job, &options).await
    }

    pub async fn enqueue_command<T: Serialize>(
        &self,
        command: &str,
        payload: &T,
        options: JobOptions,
    ) -> JobsResult<JobRef> {
        let body = serde_json::to_value(payload)?;
        let job = self.enqueue(BackgroundJob::command(command, body), options).await?;
        Ok(job.job_ref())
    }

    pub async fn enqueue_api<T: Serialize>(
        &self,
        request: &str,
        payload: &T,
        options: JobOptions,
    ) -> JobsResult<JobRef> {
        let body = serde_json::to_value(payload)?;
        let job = self.enqueue(BackgroundJob::api(request, body), options).await?;
        Ok(job.job_ref())
    }

    /// Cancel queued jobs outright; running jobs get a cooperative cancel
    /// request their handler may ignore.
    pub async fn cancel(&self, filter: CancelFilter) -> JobsResult<BatchResult> {
        let ids = if filter.ids.is_empty() {
            let query = JobQuery {
                worker: filter.worker.clone(),
                state: filter.state,
                ..JobQuery::default()
            };
            let jobs = self.store.query_live(&query).await?;
            match filter.batch_id.as_deref() {
                Some(batch_id) => DependencyGraph::batch(batch_id, &jobs),
                None => jobs.into_iter().map(|job| job.id).collect(),
            }
        } else {
            filter.ids
        };

        let mut result = BatchResult::default();
        for id in ids {
            match self.cancel_one(id).await {
                Ok(()) => result.ok(id),
                Err(err) => result.err(id, err),
            }
        }
        Ok(result)
    }

    async fn cancel_one(&self, id: JobId) -> JobsResult<()> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| JobsError::job_not_found(id))?;
        if job.location != JobLocation::Live {
            return Err(JobsError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Cancelled,
            });
        }

        // the handler already finished; only the completion write is pending
        if job.state == JobState::Executed {
            return Err(JobsError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Cancelled,
            });
        }

        if matches!(job.state, JobState::Queued | JobState::Failed) {
            let patch = JobPatch::new()
                .error(JobError::new(ErrorCode::Cancelled, "cancelled by request"))
                .log("cancelled by request");
            match self
                .store
                .transition(id, &[JobState::Queued, JobState::Failed], JobState::Cancelled, patch)
                .await?
            {
                Transition::Applied(_) => {
                    let archived = self.store.move_to_terminal(id).await?;
                    crate::telemetry::record_job_finished(
                        archived.pool(),
                        archived.handler_key().unwrap_or_default(),
                        "cancelled",
                        archived.duration_ms,
                    );
                    self.events
                        .emit(&archived, JobEventPayload::Cancelled { job_id: id });
                    return Ok(());
                }
                Transition::Missing => return Err(JobsError::job_not_found(id)),
                Transition::Conflict { actual } if actual != JobState::Started => {
                    return Err(JobsError::InvalidTransition {
                        id,
                        from: actual,
                        to: JobState::Cancelled,
                    });
                }
                // claimed in the meantime; fall through to a cooperative request
                Transition::Conflict { .. } => {}
            }
        }

        let signalled = self.executor.cancels().request(id);
        tracing::info!(job_id = %id, signalled, "cancel requested for running job");
        self.store
            .update(id, JobPatch::new().log("cancel requested"))
            .await?;
        Ok(())
    }

    /// Cancel requests that running handlers ignored, keyed by job.
    pub fn ineffective_cancellations(&self) -> HashMap<JobId, JobError> {
        self.executor.cancels().ineffective()
    }

    /// Put archived failed jobs back on the queue with a fresh attempt budget.
    /// Requeueing a job that is already queued succeeds without change.
    pub async fn requeue(&self, ids: impl IntoIterator<Item = JobId>) -> JobsResult<BatchResult> {
        let mut result = BatchResult::default();
        for id in ids {
            match self.requeue_one(id).await {
                Ok(()) => result.ok(id),
                Err(err) => result.err(id, err),
            }
        }
        Ok(result)
    }

    async fn requeue_one(&self, id: JobId) -> JobsResult<()> {
        if let Some(job) = self.store.get(id).await?
            && job.location == JobLocation::Live
            && job.state == JobState::Queued
        {
            return Ok(());
        }
        let job = self.store.requeue_failed(id).await?;
        tracing::info!(job_id = %id, "failed job requeued");
        self.events
            .emit(&job, JobEventPayload::Requeued { job_id: id });
        Ok(())
    }

    /// Progress, status and logs from byte offset `log_start` onwards.
    pub async fn progress(&self, id: JobId, log_start: Option<usize>) -> JobsResult<JobProgress> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| JobsError::job_not_found(id))?;
        Ok(JobProgress {
            id: job.id,
            state: job.state,
            progress: job.progress,
            status: job.status.clone(),
            logs: job.logs_from(log_start.unwrap_or(0)).to_string(),
            duration_ms: job.duration_ms,
            error: job.error.clone(),
        })
    }

    pub async fn get_job(&self, lookup: impl Into<JobLookup>) -> JobsResult<JobInfo> {
        let job = match lookup.into() {
            JobLookup::Id(id) => self.store.get(id).await?,
            JobLookup::RefId(ref_id) => self.store.get_by_ref_id(&ref_id).await?,
        };
        let Some(job) = job else {
            return Ok(JobInfo::default());
        };

        let mut info = JobInfo {
            summary: self.store.summary(job.id).await?,
            ..JobInfo::default()
        };
        let live = self.store.query_live(&JobQuery::all()).await?;
        info.dependents = DependencyGraph::dependents_of(job.id, &live);
        let edges: HashMap<JobId, Option<JobId>> =
            live.iter().map(|job| (job.id, job.depends_on)).collect();
        info.waiting_on = DependencyGraph::chain(job.id, |id| edges.get(&id).copied().flatten())
            .into_iter()
            .filter(|id| edges.contains_key(id))
            .collect();

        match job.location {
            JobLocation::Live => info.queued = Some(job),
            JobLocation::Completed => info.completed = Some(job),
            JobLocation::Failed => info.failed = Some(job),
        }
        Ok(info)
    }

    pub async fn query_jobs(&self, query: &JobQuery) -> JobsResult<Vec<BackgroundJob>> {
        self.store.query_live(query).await
    }

    pub async fn query_summaries(&self, query: &JobQuery) -> JobsResult<Vec<JobSummary>> {
        self.store.query_summaries(query).await
    }

    pub async fn query_completed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        self.store.query_completed(month, query).await
    }

    pub async fn query_failed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        self.store.query_failed(month, query).await
    }

    pub async fn register_task(&self, task: ScheduledTask) -> JobsResult<ScheduledTask> {
        let task = self.store.upsert_task(task).await?;
        tracing::info!(task = %task.name, "scheduled task registered");
        Ok(task)
    }

    pub async fn remove_task(&self, name: &str) -> JobsResult<bool> {
        self.store.delete_task(name).await
    }

    pub async fn scheduled_tasks(&self) -> JobsResult<Vec<ScheduledTask>> {
        self.store.tasks().await
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.stats.snapshot()
    }

    /// Store and pool overview for `month` (current month when `None`).
    pub async fn info(&self, month: Option<MonthKey>) -> JobsResult<JobsInfo> {
        let now = Utc::now();
        let month = month.unwrap_or_else(|| MonthKey::of(now));
        let all = JobQuery::all();
        Ok(JobsInfo {
            month,
            month_dbs: self.store.months().await?,
            table_counts: self.store.table_counts().await?,
            completed_in_month: self.store.query_completed(month, &all).await?.len(),
            failed_in_month: self.store.query_failed(month, &all).await?.len(),
            worker_stats: self.worker_stats(),
            queue_counts: self.store.queue_snapshot(now).await?.pools,
        })
    }

    /// Job counts grouped by command, pool and state for jobs created in
    /// `[from, to)`.
    pub async fn dashboard(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> JobsResult<Vec<JobStatSummary>> {
        let query = JobQuery {
            created_after: Some(from),
            created_before: Some(to),
            ..JobQuery::default()
        };
        let mut groups: BTreeMap<(String, String, &'static str), JobStatSummary> = BTreeMap::new();
        for summary in self.store.query_summaries(&query).await? {
            let command = summary
                .command
                .clone()
                .or_else(|| summary.request.clone())
                .unwrap_or_default();
            let worker = summary
                .worker
                .clone()
                .unwrap_or_else(|| crate::job::DEFAULT_POOL.to_string());
            let entry = groups
                .entry((command.clone(), worker.clone(), summary.state.as_str()))
                .or_insert_with(|| JobStatSummary {
                    command,
                    worker,
                    state: summary.state,
                    count: 0,
                    total_duration_ms: 0,
                });
            entry.count += 1;
            entry.total_duration_ms += summary.duration_ms;
        }
        Ok(groups.into_values().collect())
    }

    /// Run a command handler directly without storing a job.
    pub async fn execute_transient(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> JobsResult<Option<serde_json::Value>> {
        let handler = self
            .executor
            .registry()
            .get(command)
            .ok_or_else(|| JobsError::NotFound(format!("handler '{command}'")))?;
        let job = BackgroundJob::command(command, payload.clone());
        let timeout_secs = self.executor.timeout_secs(&job);
        let ctx = JobContext::detached(job);

        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            handler.execute(ctx, payload),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(match err.downcast::<JobsError>() {
                Ok(typed) => typed,
                Err(other) => JobsError::Store(other),
            }),
            Err(_) => Err(JobsError::Timeout(JobId::default(), timeout_secs)),
        }
    }
}
