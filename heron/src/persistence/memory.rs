use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::cron::ScheduledTask;
use crate::dependency::{DependencyGraph, Eligibility};
use crate::error::{ErrorCode, JobsError, JobsResult};
use crate::job::{
    BackgroundJob, JobError, JobId, JobLocation, JobState, JobSummary, MonthKey,
};
use crate::store::{
    ClaimOutcome, ClaimRequest, JobPatch, JobQuery, JobStore, QueueSnapshot, Transition,
    apply_transition,
};

type Partition = BTreeMap<MonthKey, BTreeMap<JobId, BackgroundJob>>;

#[derive(Debug, Default)]
struct Tables {
    next_job_id: i64,
    next_task_id: i64,
    live: BTreeMap<JobId, BackgroundJob>,
    completed: Partition,
    failed: Partition,
    archived: HashMap<JobId, (JobLocation, MonthKey)>,
    summaries: BTreeMap<JobId, JobSummary>,
    ref_ids: HashMap<String, JobId>,
    tasks: BTreeMap<String, ScheduledTask>,
}

impl Tables {
    fn state_of(&self, id: JobId) -> Option<JobState> {
        self.summaries.get(&id).map(|s| s.state)
    }

    /// State as seen by dependents. A live `Failed` job is between attempts,
    /// so only an archived failure is final.
    fn dependency_state(&self, id: JobId) -> Option<JobState> {
        match self.live.get(&id).map(|job| job.state) {
            Some(JobState::Failed) => Some(JobState::Queued),
            Some(state) => Some(state),
            None => self.state_of(id),
        }
    }

    fn refresh_summary(&mut self, job: &BackgroundJob) {
        self.summaries.insert(job.id, job.summary());
    }

    fn archived_job(&self, id: JobId) -> Option<&BackgroundJob> {
        let (location, month) = self.archived.get(&id)?;
        let partition = match location {
            JobLocation::Completed => &self.completed,
            JobLocation::Failed => &self.failed,
            JobLocation::Live => return None,
        };
        partition.get(month)?.get(&id)
    }

    fn find(&self, id: JobId) -> Option<&BackgroundJob> {
        self.live.get(&id).or_else(|| self.archived_job(id))
    }
}

enum ClaimStep {
    Start(Option<JobId>),
    Block(JobError),
}

/// Job store held entirely in process memory.
///
/// A single mutex serializes every operation, which is what makes
/// `claim_next` safe under concurrent callers. Archived jobs are kept in
/// per-month partitions mirroring the monthly tables of a database backend.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn query_partition(
        partition: &Partition,
        month: MonthKey,
        query: &JobQuery,
    ) -> Vec<BackgroundJob> {
        let Some(jobs) = partition.get(&month) else {
            return Vec::new();
        };
        query.paginate(jobs.values().filter(|job| query.matches(job)).cloned())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, mut job: BackgroundJob) -> JobsResult<BackgroundJob> {
        job.validate()?;
        let mut tables = self.tables.lock();

        if let Some(dependency) = job.depends_on {
            match tables.state_of(dependency) {
                None => {
                    return Err(JobsError::NotFound(format!(
                        "dependency job {dependency}"
                    )));
                }
                Some(JobState::Completed) if job.parent_id.is_none() => {
                    job.parent_id = Some(dependency);
                }
                Some(_) => {}
            }
        }

        tables.next_job_id += 1;
        job.id = JobId(tables.next_job_id);
        job.state = JobState::Queued;
        job.attempts = 0;
        job.location = JobLocation::Live;
        job.last_activity_date = Utc::now();

        tables.refresh_summary(&job);
        tables.ref_ids.insert(job.ref_id.clone(), job.id);
        tables.live.insert(job.id, job.clone());
        debug!(job_id = %job.id, pool = job.pool(), "job stored");
        Ok(job)
    }

    async fn get(&self, id: JobId) -> JobsResult<Option<BackgroundJob>> {
        Ok(self.tables.lock().find(id).cloned())
    }

    async fn get_by_ref_id(&self, ref_id: &str) -> JobsResult<Option<BackgroundJob>> {
        let tables = self.tables.lock();
        Ok(tables
            .ref_ids
            .get(ref_id)
            .and_then(|id| tables.find(*id))
            .cloned())
    }

    async fn summary(&self, id: JobId) -> JobsResult<Option<JobSummary>> {
        Ok(self.tables.lock().summaries.get(&id).cloned())
    }

    async fn claim_next(&self, request: ClaimRequest) -> JobsResult<ClaimOutcome> {
        let mut tables = self.tables.lock();
        let mut candidates: Vec<&BackgroundJob> = tables
            .live
            .values()
            .filter(|job| job.state == JobState::Queued && job.pool() == request.pool)
            .collect();
        candidates.sort_by_key(|job| job.dispatch_key());

        let mut steps = Vec::new();
        let mut ready = 0;
        for job in candidates {
            match DependencyGraph::evaluate(job, request.now, |id| tables.dependency_state(id)) {
                Eligibility::Ready if ready < request.limit => {
                    ready += 1;
                    steps.push((job.id, ClaimStep::Start(job.depends_on)));
                }
                Eligibility::Blocked { on, state } => {
                    let err = JobsError::DependencyFailed {
                        job: job.id,
                        dependency: on,
                        state,
                    };
                    steps.push((job.id, ClaimStep::Block(JobError::from(&err))));
                }
                Eligibility::Orphaned { on } => {
                    let message = format!("dependency job {on} no longer exists");
                    steps.push((
                        job.id,
                        ClaimStep::Block(JobError::new(ErrorCode::DependencyFailed, message)),
                    ));
                }
                _ => {}
            }
        }

        let mut outcome = ClaimOutcome::default();
        for (id, step) in steps {
            let Some(mut job) = tables.live.remove(&id) else {
                continue;
            };
            let result = match step {
                ClaimStep::Start(dependency) => {
                    let patch = JobPatch {
                        parent_id: dependency.filter(|_| job.parent_id.is_none()),
                        ..JobPatch::default()
                    };
                    apply_transition(&mut job, JobState::Started, &patch, request.now)
                        .map(|_| &mut outcome.claimed)
                }
                ClaimStep::Block(error) => apply_transition(
                    &mut job,
                    JobState::Failed,
                    &JobPatch::new().error(error),
                    request.now,
                )
                .map(|_| &mut outcome.dependency_failed),
            };
            tables.refresh_summary(&job);
            tables.live.insert(id, job.clone());
            result?.push(job);
        }

        Ok(outcome)
    }

    async fn transition(
        &self,
        id: JobId,
        expected: &[JobState],
        to: JobState,
        patch: JobPatch,
    ) -> JobsResult<Transition> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.live.get_mut(&id) else {
            return Ok(Transition::Missing);
        };
        if !expected.contains(&job.state) {
            return Ok(Transition::Conflict { actual: job.state });
        }
        apply_transition(job, to, &patch, Utc::now())?;
        let job = job.clone();
        tables.refresh_summary(&job);
        Ok(Transition::Applied(job))
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> JobsResult<Option<BackgroundJob>> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.live.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply(job, Utc::now());
        let job = job.clone();
        tables.refresh_summary(&job);
        Ok(Some(job))
    }

    async fn update_archived(
        &self,
        id: JobId,
        patch: JobPatch,
    ) -> JobsResult<Option<BackgroundJob>> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let Some((location, month)) = tables.archived.get(&id).copied() else {
            return Ok(None);
        };
        let partition = match location {
            JobLocation::Completed => &mut tables.completed,
            JobLocation::Failed => &mut tables.failed,
            JobLocation::Live => return Ok(None),
        };
        let Some(job) = partition.get_mut(&month).and_then(|jobs| jobs.get_mut(&id)) else {
            return Ok(None);
        };
        patch.apply(job, Utc::now());
        let job = job.clone();
        tables.refresh_summary(&job);
        Ok(Some(job))
    }

    async fn move_to_terminal(&self, id: JobId) -> JobsResult<BackgroundJob> {
        let mut tables = self.tables.lock();
        let state = match tables.live.get(&id) {
            Some(job) => job.state,
            None => return Err(JobsError::job_not_found(id)),
        };
        if !state.is_terminal() {
            return Err(JobsError::Validation(format!(
                "job {id} is {state} and cannot be archived"
            )));
        }

        let Some(mut job) = tables.live.remove(&id) else {
            return Err(JobsError::job_not_found(id));
        };
        let month = job.month();
        job.location = if state == JobState::Completed {
            JobLocation::Completed
        } else {
            JobLocation::Failed
        };
        let partition = match job.location {
            JobLocation::Completed => &mut tables.completed,
            _ => &mut tables.failed,
        };
        partition.entry(month).or_default().insert(id, job.clone());
        tables.archived.insert(id, (job.location, month));
        tables.refresh_summary(&job);
        debug!(job_id = %id, state = %state, month = %month, "job archived");
        Ok(job)
    }

    async fn requeue_failed(&self, id: JobId) -> JobsResult<BackgroundJob> {
        let mut tables = self.tables.lock();
        if let Some(job) = tables.live.get(&id) {
            return match job.state {
                JobState::Queued => Ok(job.clone()),
                from => Err(JobsError::InvalidTransition {
                    id,
                    from,
                    to: JobState::Queued,
                }),
            };
        }

        let (location, month) = tables
            .archived
            .get(&id)
            .copied()
            .ok_or_else(|| JobsError::job_not_found(id))?;
        let from = tables.archived_job(id).map_or(JobState::Completed, |j| j.state);
        if location != JobLocation::Failed || from != JobState::Failed {
            return Err(JobsError::InvalidTransition {
                id,
                from,
                to: JobState::Queued,
            });
        }

        let mut job = tables
            .failed
            .get_mut(&month)
            .and_then(|jobs| jobs.remove(&id))
            .ok_or_else(|| JobsError::job_not_found(id))?;
        tables.archived.remove(&id);

        job.attempts = 0;
        job.duration_ms = 0;
        job.progress = 0.0;
        job.run_after = None;
        job.location = JobLocation::Live;
        let patch = JobPatch {
            clear_error: true,
            ..JobPatch::default()
        };
        apply_transition(&mut job, JobState::Queued, &patch, Utc::now())?;
        tables.refresh_summary(&job);
        tables.live.insert(id, job.clone());
        Ok(job)
    }

    async fn query_live(&self, query: &JobQuery) -> JobsResult<Vec<BackgroundJob>> {
        let tables = self.tables.lock();
        Ok(query.paginate(tables.live.values().filter(|job| query.matches(job)).cloned()))
    }

    async fn query_summaries(&self, query: &JobQuery) -> JobsResult<Vec<JobSummary>> {
        let tables = self.tables.lock();
        Ok(query.paginate(
            tables
                .summaries
                .values()
                .filter(|s| query.matches_summary(s))
                .cloned(),
        ))
    }

    async fn query_completed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        let tables = self.tables.lock();
        Ok(Self::query_partition(&tables.completed, month, query))
    }

    async fn query_failed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        let tables = self.tables.lock();
        Ok(Self::query_partition(&tables.failed, month, query))
    }

    async fn months(&self) -> JobsResult<Vec<MonthKey>> {
        let tables = self.tables.lock();
        let months: BTreeSet<MonthKey> = tables
            .completed
            .keys()
            .chain(tables.failed.keys())
            .copied()
            .collect();
        Ok(months.into_iter().rev().collect())
    }

    async fn table_counts(&self) -> JobsResult<BTreeMap<String, usize>> {
        let tables = self.tables.lock();
        let count = |p: &Partition| p.values().map(BTreeMap::len).sum::<usize>();
        Ok(BTreeMap::from([
            ("jobs".to_string(), tables.live.len()),
            ("job_summaries".to_string(), tables.summaries.len()),
            ("completed_jobs".to_string(), count(&tables.completed)),
            ("failed_jobs".to_string(), count(&tables.failed)),
            ("scheduled_tasks".to_string(), tables.tasks.len()),
        ]))
    }

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> JobsResult<QueueSnapshot> {
        let tables = self.tables.lock();
        let mut snapshot = QueueSnapshot::new(now);
        for job in tables.live.values() {
            snapshot.record(job);
        }
        Ok(snapshot)
    }

    async fn pending_pools(&self, now: DateTime<Utc>) -> JobsResult<Vec<String>> {
        let tables = self.tables.lock();
        let pools: BTreeSet<&str> = tables
            .live
            .values()
            .filter(|job| {
                job.state == JobState::Queued && job.run_after.is_none_or(|at| at <= now)
            })
            .map(|job| job.pool())
            .collect();
        Ok(pools.into_iter().map(str::to_string).collect())
    }

    async fn started_jobs(&self) -> JobsResult<Vec<BackgroundJob>> {
        let tables = self.tables.lock();
        Ok(tables
            .live
            .values()
            .filter(|job| matches!(job.state, JobState::Started | JobState::Executed))
            .cloned()
            .collect())
    }

    async fn upsert_task(&self, mut task: ScheduledTask) -> JobsResult<ScheduledTask> {
        task.validate()?;
        let mut tables = self.tables.lock();
        match tables.tasks.get(&task.name) {
            Some(existing) => {
                task.id = existing.id;
                task.last_run = task.last_run.or(existing.last_run);
                task.last_job_id = task.last_job_id.or(existing.last_job_id);
            }
            None => {
                tables.next_task_id += 1;
                task.id = tables.next_task_id;
            }
        }
        tables.tasks.insert(task.name.clone(), task.clone());
        Ok(task)
    }

    async fn delete_task(&self, name: &str) -> JobsResult<bool> {
        Ok(self.tables.lock().tasks.remove(name).is_some())
    }

    async fn task(&self, name: &str) -> JobsResult<Option<ScheduledTask>> {
        Ok(self.tables.lock().tasks.get(name).cloned())
    }

    async fn tasks(&self) -> JobsResult<Vec<ScheduledTask>> {
        Ok(self.tables.lock().tasks.values().cloned().collect())
    }

    async fn record_task_run(
        &self,
        task_id: i64,
        expected_last_run: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> JobsResult<bool> {
        let mut tables = self.tables.lock();
        let Some(task) = tables.tasks.values_mut().find(|t| t.id == task_id) else {
            return Err(JobsError::NotFound(format!("scheduled task {task_id}")));
        };
        if task.last_run != expected_last_run {
            return Ok(false);
        }
        task.last_run = Some(run_at);
        task.last_job_id = Some(job_id);
        Ok(true)
    }
}
