use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heron::{
    BackgroundJob, ClaimOutcome, ClaimRequest, InMemoryJobStore, JobId, JobPatch, JobQuery,
    JobState, JobStore, JobSummary, JobsError, JobsResult, MonthKey, QueueSnapshot,
    ScheduledTask, Transition,
};
use parking_lot::Mutex;

/// In-memory store that refuses to archive selected jobs, for exercising
/// the paths that recover from a lost final write.
#[derive(Debug, Default, Clone)]
pub struct FaultyStore {
    inner: Arc<InMemoryJobStore>,
    failing_archives: Arc<Mutex<HashSet<JobId>>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `move_to_terminal` fail for `id` until [`FaultyStore::heal`].
    pub fn fail_archive_of(&self, id: JobId) {
        self.failing_archives.lock().insert(id);
    }

    pub fn heal(&self) {
        self.failing_archives.lock().clear();
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn enqueue(&self, job: BackgroundJob) -> JobsResult<BackgroundJob> {
        self.inner.enqueue(job).await
    }

    async fn get(&self, id: JobId) -> JobsResult<Option<BackgroundJob>> {
        self.inner.get(id).await
    }

    async fn get_by_ref_id(&self, ref_id: &str) -> JobsResult<Option<BackgroundJob>> {
        self.inner.get_by_ref_id(ref_id).await
    }

    async fn summary(&self, id: JobId) -> JobsResult<Option<JobSummary>> {
        self.inner.summary(id).await
    }

    async fn claim_next(&self, request: ClaimRequest) -> JobsResult<ClaimOutcome> {
        self.inner.claim_next(request).await
    }

    async fn transition(
        &self,
        id: JobId,
        expected: &[JobState],
        to: JobState,
        patch: JobPatch,
    ) -> JobsResult<Transition> {
        self.inner.transition(id, expected, to, patch).await
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> JobsResult<Option<BackgroundJob>> {
        self.inner.update(id, patch).await
    }

    async fn update_archived(
        &self,
        id: JobId,
        patch: JobPatch,
    ) -> JobsResult<Option<BackgroundJob>> {
        self.inner.update_archived(id, patch).await
    }

    async fn move_to_terminal(&self, id: JobId) -> JobsResult<BackgroundJob> {
        if self.failing_archives.lock().contains(&id) {
            return Err(JobsError::Store(anyhow::anyhow!("archive of job {id} refused")));
        }
        self.inner.move_to_terminal(id).await
    }

    async fn requeue_failed(&self, id: JobId) -> JobsResult<BackgroundJob> {
        self.inner.requeue_failed(id).await
    }

    async fn query_live(&self, query: &JobQuery) -> JobsResult<Vec<BackgroundJob>> {
        self.inner.query_live(query).await
    }

    async fn query_summaries(&self, query: &JobQuery) -> JobsResult<Vec<JobSummary>> {
        self.inner.query_summaries(query).await
    }

    async fn query_completed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        self.inner.query_completed(month, query).await
    }

    async fn query_failed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        self.inner.query_failed(month, query).await
    }

    async fn months(&self) -> JobsResult<Vec<MonthKey>> {
        self.inner.months().await
    }

    async fn table_counts(&self) -> JobsResult<BTreeMap<String, usize>> {
        self.inner.table_counts().await
    }

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> JobsResult<QueueSnapshot> {
        self.inner.queue_snapshot(now).await
    }

    async fn pending_pools(&self, now: DateTime<Utc>) -> JobsResult<Vec<String>> {
        self.inner.pending_pools(now).await
    }

    async fn started_jobs(&self) -> JobsResult<Vec<BackgroundJob>> {
        self.inner.started_jobs().await
    }

    async fn upsert_task(&self, task: ScheduledTask) -> JobsResult<ScheduledTask> {
        self.inner.upsert_task(task).await
    }

    async fn delete_task(&self, name: &str) -> JobsResult<bool> {
        self.inner.delete_task(name).await
    }

    async fn task(&self, name: &str) -> JobsResult<Option<ScheduledTask>> {
        self.inner.task(name).await
    }

    async fn tasks(&self) -> JobsResult<Vec<ScheduledTask>> {
        self.inner.tasks().await
    }

    async fn record_task_run(
        &self,
        task_id: i64,
        expected_last_run: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> JobsResult<bool> {
        self.inner
            .record_task_run(task_id, expected_last_run, run_at, job_id)
            .await
    }
}
