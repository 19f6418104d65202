use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::ScheduledTask;
use crate::error::{JobsError, JobsResult};
use crate::job::{BackgroundJob, JobError, JobId, JobState, JobSummary, MonthKey};

/// Persistence boundary for jobs, summaries and scheduled tasks.
///
/// Implementations must make `claim_next` and `transition` atomic with
/// respect to each other: a queued job is claimed by at most one caller,
/// and a state write only lands if the job is still in an expected state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and insert a new job, assigning its id. The summary row is
    /// written in the same operation.
    async fn enqueue(&self, job: BackgroundJob) -> JobsResult<BackgroundJob>;

    /// Look a job up in the live store, then the completed and failed stores.
    async fn get(&self, id: JobId) -> JobsResult<Option<BackgroundJob>>;

    async fn get_by_ref_id(&self, ref_id: &str) -> JobsResult<Option<BackgroundJob>>;

    async fn summary(&self, id: JobId) -> JobsResult<Option<JobSummary>>;

    /// Atomically move up to `request.limit` eligible queued jobs of one pool
    /// to `Started`, in dispatch order. Jobs whose dependency can never
    /// complete are failed with `DependencyFailed` in the same pass.
    async fn claim_next(&self, request: ClaimRequest) -> JobsResult<ClaimOutcome>;

    /// Compare-and-swap a live job's state. Nothing is written when the job is
    /// no longer in one of the `expected` states.
    async fn transition(
        &self,
        id: JobId,
        expected: &[JobState],
        to: JobState,
        patch: JobPatch,
    ) -> JobsResult<Transition>;

    /// Apply progress, status or log updates to a live job without a state change.
    async fn update(&self, id: JobId, patch: JobPatch) -> JobsResult<Option<BackgroundJob>>;

    /// Apply a patch to an archived job. Used for callback bookkeeping
    /// (`notified_date`, log lines); the state never changes.
    async fn update_archived(
        &self,
        id: JobId,
        patch: JobPatch,
    ) -> JobsResult<Option<BackgroundJob>>;

    /// Relocate a terminal live job to the month-partitioned completed or failed store.
    async fn move_to_terminal(&self, id: JobId) -> JobsResult<BackgroundJob>;

    /// Put an archived failed job back on the live queue with a fresh attempt
    /// budget. A job that is already queued is returned unchanged.
    async fn requeue_failed(&self, id: JobId) -> JobsResult<BackgroundJob>;

    async fn query_live(&self, query: &JobQuery) -> JobsResult<Vec<BackgroundJob>>;

    async fn query_summaries(&self, query: &JobQuery) -> JobsResult<Vec<JobSummary>>;

    async fn query_completed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>>;

    async fn query_failed(&self, month: MonthKey, query: &JobQuery)
    -> JobsResult<Vec<BackgroundJob>>;

    /// Months that have archived jobs, newest first.
    async fn months(&self) -> JobsResult<Vec<MonthKey>>;

    async fn table_counts(&self) -> JobsResult<BTreeMap<String, usize>>;

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> JobsResult<QueueSnapshot>;

    /// Pools that hold at least one queued job due at `now`.
    async fn pending_pools(&self, now: DateTime<Utc>) -> JobsResult<Vec<String>>;

    /// Live jobs in `Started` or `Executed`.
    async fn started_jobs(&self) -> JobsResult<Vec<BackgroundJob>>;

    /// Insert a task (assigning its id) or replace the one with the same name.
    async fn upsert_task(&self, task: ScheduledTask) -> JobsResult<ScheduledTask>;

    async fn delete_task(&self, name: &str) -> JobsResult<bool>;

    async fn task(&self, name: &str) -> JobsResult<Option<ScheduledTask>>;

    async fn tasks(&self) -> JobsResult<Vec<ScheduledTask>>;

    /// Record a task run if `last_run` still equals `expected_last_run`.
    /// Returns `false` when another materializer got there first.
    async fn record_task_run(
        &self,
        task_id: i64,
        expected_last_run: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> JobsResult<bool>;
}

#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub pool: String,
    pub limit: usize,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn new(pool: impl Into<String>, limit: usize, now: DateTime<Utc>) -> Self {
        Self {
            pool: pool.into(),
            limit,
            now,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClaimOutcome {
    /// Jobs now in `Started`, owned by the caller.
    pub claimed: Vec<BackgroundJob>,
    /// Jobs failed with `DependencyFailed` during this claim, still live.
    pub dependency_failed: Vec<BackgroundJob>,
}

/// Result of a compare-and-swap state write.
#[derive(Clone, Debug)]
pub enum Transition {
    Applied(BackgroundJob),
    Conflict { actual: JobState },
    Missing,
}

impl Transition {
    pub fn applied(self) -> Option<BackgroundJob> {
        match self {
            Transition::Applied(job) => Some(job),
            _ => None,
        }
    }
}

/// Partial update applied together with a state write or on its own.
#[derive(Clone, Debug, Default)]
pub struct JobPatch {
    pub progress: Option<f64>,
    pub status: Option<String>,
    pub append_log: Option<String>,
    pub response: Option<String>,
    pub response_body: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub clear_error: bool,
    pub run_after: Option<DateTime<Utc>>,
    pub parent_id: Option<JobId>,
    pub notified_date: Option<DateTime<Utc>>,
    /// Undo the attempt counted by a claim that never ran the handler.
    pub refund_attempt: bool,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.append_log = Some(line.into());
        self
    }

    pub fn error(mut self, error: JobError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn refund_attempt(mut self) -> Self {
        self.refund_attempt = true;
        self
    }

    pub fn response(mut self, response_body: Option<serde_json::Value>) -> Self {
        self.response = response_body.as_ref().map(json_type_name);
        self.response_body = response_body;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.status.is_none()
            && self.append_log.is_none()
            && self.response.is_none()
            && self.response_body.is_none()
            && self.error.is_none()
            && !self.clear_error
            && self.run_after.is_none()
            && self.parent_id.is_none()
            && self.notified_date.is_none()
            && !self.refund_attempt
    }

    /// Apply the patch fields to `job`. A log line without an explicit status
    /// also becomes the status.
    pub fn apply(&self, job: &mut BackgroundJob, now: DateTime<Utc>) {
        if let Some(progress) = self.progress {
            job.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(line) = &self.append_log {
            let line = line.trim_end_matches('\n');
            job.logs.push_str(line);
            job.logs.push('\n');
            if self.status.is_none()
                && let Some(last) = line.lines().last()
            {
                job.status = Some(last.to_string());
            }
        }
        if let Some(status) = &self.status {
            job.status = Some(status.clone());
        }
        if self.response_body.is_some() {
            job.response = self.response.clone();
            job.response_body = self.response_body.clone();
        }
        if self.clear_error {
            job.error = None;
            job.error_code = None;
        }
        if let Some(error) = &self.error {
            job.error_code = Some(error.error_code);
            job.error = Some(error.clone());
        }
        if let Some(run_after) = self.run_after {
            job.run_after = Some(run_after);
        }
        if let Some(parent_id) = self.parent_id {
            job.parent_id = Some(parent_id);
        }
        if let Some(notified) = self.notified_date {
            job.notified_date = Some(notified);
        }
        if self.refund_attempt {
            job.attempts = job.attempts.saturating_sub(1);
        }
        job.last_activity_date = now;
    }
}

fn json_type_name(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
    .to_string()
}

/// Validate and apply a state change, including the bookkeeping each target
/// state implies. Shared by every store implementation.
pub fn apply_transition(
    job: &mut BackgroundJob,
    to: JobState,
    patch: &JobPatch,
    now: DateTime<Utc>,
) -> JobsResult<()> {
    if !job.state.can_transition_to(to) {
        return Err(JobsError::InvalidTransition {
            id: job.id,
            from: job.state,
            to,
        });
    }

    patch.apply(job, now);

    match to {
        JobState::Started => {
            job.started_date = Some(now);
            job.attempts += 1;
            job.progress = 0.0;
        }
        JobState::Queued => {
            job.started_date = None;
            job.completed_date = None;
        }
        JobState::Executed => {
            record_duration(job, now);
        }
        JobState::Completed | JobState::Failed | JobState::Cancelled => {
            if to == JobState::Completed {
                job.progress = 1.0;
            }
            job.completed_date = Some(now);
            record_duration(job, now);
        }
    }

    job.state = to;
    job.last_activity_date = now;
    Ok(())
}

fn record_duration(job: &mut BackgroundJob, now: DateTime<Utc>) {
    if let Some(started) = job.started_date {
        job.duration_ms = (now - started).num_milliseconds().max(0);
    }
}

/// Filters and paging for job and summary queries.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    pub id: Option<JobId>,
    pub ref_id: Option<String>,
    pub parent_id: Option<JobId>,
    pub worker: Option<String>,
    pub state: Option<JobState>,
    pub command: Option<String>,
    pub batch_id: Option<String>,
    pub tag: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub skip: usize,
    pub take: Option<usize>,
}

impl JobQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn by_worker(worker: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.into()),
            ..Self::default()
        }
    }

    pub fn page(mut self, skip: usize, take: usize) -> Self {
        self.skip = skip;
        self.take = Some(take);
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn matches_fields(
        &self,
        id: JobId,
        ref_id: &str,
        parent_id: Option<JobId>,
        worker: Option<&str>,
        state: JobState,
        handler: Option<&str>,
        batch_id: Option<&str>,
        tag: Option<&str>,
        created: DateTime<Utc>,
    ) -> bool {
        self.id.is_none_or(|want| want == id)
            && self.ref_id.as_deref().is_none_or(|want| want == ref_id)
            && self.parent_id.is_none_or(|want| Some(want) == parent_id)
            && self.worker.as_deref().is_none_or(|want| Some(want) == worker)
            && self.state.is_none_or(|want| want == state)
            && self.command.as_deref().is_none_or(|want| Some(want) == handler)
            && self.batch_id.as_deref().is_none_or(|want| Some(want) == batch_id)
            && self.tag.as_deref().is_none_or(|want| Some(want) == tag)
            && self.created_after.is_none_or(|after| created >= after)
            && self.created_before.is_none_or(|before| created < before)
    }

    pub fn matches(&self, job: &BackgroundJob) -> bool {
        self.matches_fields(
            job.id,
            &job.ref_id,
            job.parent_id,
            job.worker.as_deref(),
            job.state,
            job.handler_key(),
            job.batch_id.as_deref(),
            job.tag.as_deref(),
            job.created_date,
        )
    }

    pub fn matches_summary(&self, summary: &JobSummary) -> bool {
        let handler = summary
            .command
            .as_deref()
            .or(summary.request.as_deref());
        self.matches_fields(
            summary.id,
            &summary.ref_id,
            summary.parent_id,
            summary.worker.as_deref(),
            summary.state,
            handler,
            summary.batch_id.as_deref(),
            summary.tag.as_deref(),
            summary.created_date,
        )
    }

    /// Apply `skip`/`take` to an already-ordered result set.
    pub fn paginate<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.skip);
        match self.take {
            Some(take) => iter.take(take).collect(),
            None => iter.collect(),
        }
    }
}

/// Snapshot of live queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-pool statistics.
    pub pools: HashMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            pools: HashMap::new(),
        }
    }

    /// Get or create the entry for a pool.
    pub fn entry_mut(&mut self, pool: &str) -> &mut QueueSnapshotEntry {
        self.pools.entry(pool.to_string()).or_default()
    }

    /// Count every live job into its pool's entry.
    pub fn record(&mut self, job: &BackgroundJob) {
        let due = job.run_after.is_none_or(|at| at <= self.sampled_at);
        let entry = self.entry_mut(job.pool());
        entry.total_count += 1;
        match job.state {
            JobState::Queued if job.depends_on.is_some() || !due => entry.waiting_count += 1,
            JobState::Queued => entry.queued_count += 1,
            JobState::Started | JobState::Executed => entry.running_count += 1,
            _ => {}
        }
    }

    pub fn queued(&self, pool: &str) -> usize {
        self.pools.get(pool).map_or(0, |e| e.queued_count + e.waiting_count)
    }
}

/// Statistics for a single pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    /// Queued jobs that are due and have no dependency.
    pub queued_count: usize,
    /// Queued jobs waiting on a dependency or a future `run_after`.
    pub waiting_count: usize,
    /// Jobs currently executing.
    pub running_count: usize,
    /// Total number of live jobs in the pool.
    pub total_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn job() -> BackgroundJob {
        BackgroundJob::command("Report", json!({}))
    }

    #[test]
    fn test_log_without_status_sets_status() {
        let mut j = job();
        let now = Utc::now();
        JobPatch::new().log("step one").apply(&mut j, now);
        JobPatch::new().log("step two").apply(&mut j, now);
        assert_eq!(j.logs, "step one\nstep two\n");
        assert_eq!(j.status.as_deref(), Some("step two"));

        JobPatch::new().log("step three").status("busy").apply(&mut j, now);
        assert_eq!(j.status.as_deref(), Some("busy"));
    }

    #[test]
    fn test_claim_transition_counts_attempt() {
        let mut j = job();
        let now = Utc::now();
        apply_transition(&mut j, JobState::Started, &JobPatch::new(), now).unwrap();
        assert_eq!(j.attempts, 1);
        assert_eq!(j.started_date, Some(now));
        assert!(j.completed_date.is_none());
    }

    #[test]
    fn test_returned_claim_refunds_attempt() {
        let mut j = job();
        let now = Utc::now();
        apply_transition(&mut j, JobState::Started, &JobPatch::new(), now).unwrap();
        apply_transition(&mut j, JobState::Queued, &JobPatch::new().refund_attempt(), now)
            .unwrap();
        assert_eq!(j.attempts, 0);
        assert!(j.started_date.is_none());

        JobPatch::new().refund_attempt().apply(&mut j, now);
        assert_eq!(j.attempts, 0);
    }

    #[test]
    fn test_terminal_transition_sets_completed_date() {
        let mut j = job();
        let start = Utc::now();
        apply_transition(&mut j, JobState::Started, &JobPatch::new(), start).unwrap();
        let end = start + chrono::Duration::milliseconds(250);
        apply_transition(
            &mut j,
            JobState::Failed,
            &JobPatch::new().error(JobError::new(ErrorCode::Timeout, "late")),
            end,
        )
        .unwrap();
        assert_eq!(j.completed_date, Some(end));
        assert_eq!(j.duration_ms, 250);
        assert_eq!(j.error_code, Some(ErrorCode::Timeout));

        apply_transition(&mut j, JobState::Queued, &JobPatch::new(), end).unwrap();
        assert!(j.completed_date.is_none());
        assert!(j.started_date.is_none());
        assert_eq!(j.attempts, 1);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut j = job();
        let err = apply_transition(&mut j, JobState::Completed, &JobPatch::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, JobsError::InvalidTransition { .. }));
        assert_eq!(j.state, JobState::Queued);
    }

    #[test]
    fn test_query_filters_and_paging() {
        let mut a = job();
        a.id = JobId(1);
        a.worker = Some("mail".into());
        let mut b = job();
        b.id = JobId(2);
        let mut c = job();
        c.id = JobId(3);
        c.worker = Some("mail".into());

        let query = JobQuery::by_worker("mail");
        let hits: Vec<_> = [&a, &b, &c].into_iter().filter(|j| query.matches(j)).collect();
        assert_eq!(hits.len(), 2);

        let paged = JobQuery::all().page(1, 1).paginate(vec![a.id, b.id, c.id]);
        assert_eq!(paged, vec![JobId(2)]);
        assert!(JobQuery::all().matches_summary(&c.summary()));
    }

    #[test]
    fn test_snapshot_separates_waiting_jobs() {
        let now = Utc::now();
        let mut snapshot = QueueSnapshot::new(now);
        let ready = job();
        let mut later = job();
        later.run_after = Some(now + chrono::Duration::minutes(5));
        let mut running = job();
        running.state = JobState::Started;

        for j in [&ready, &later, &running] {
            snapshot.record(j);
        }
        let entry = &snapshot.pools["default"];
        assert_eq!(entry.queued_count, 1);
        assert_eq!(entry.waiting_count, 1);
        assert_eq!(entry.running_count, 1);
        assert_eq!(snapshot.queued("default"), 2);
    }
}
