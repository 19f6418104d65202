use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::{ErrorCode, JobsError, JobsResult};
use crate::events::JobEventPayload;
use crate::job::{BackgroundJob, JobError, JobId, JobOptions, JobRef, JobState, RequestKind};
use crate::runtime::cancel::CancelToken;
use crate::runtime::intake::JobIntake;
use crate::store::{JobPatch, JobStore};

/// A recurring job template, fired on a fixed interval or a cron expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Store-assigned id, zero until the task is saved.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default, with = "crate::job::optional_duration_secs")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub request_type: RequestKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub request_body: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_job_id: Option<JobId>,
}

/// When a task fires.
#[derive(Clone, Debug)]
pub enum TaskSchedule {
    Interval(Duration),
    Cron(cron::Schedule),
}

impl ScheduledTask {
    fn blank(name: impl Into<String>, command: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: 0,
            name: name.into(),
            interval: None,
            cron_expression: None,
            request_type: RequestKind::Command,
            command: Some(command.into()),
            request: None,
            request_body: body,
            options: JobOptions::default(),
            last_run: None,
            last_job_id: None,
        }
    }

    /// A task that runs `command` every `every`.
    pub fn interval(
        name: impl Into<String>,
        every: Duration,
        command: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        let mut task = Self::blank(name, command, body);
        task.interval = Some(every);
        task
    }

    /// A task that runs `command` on a cron expression (five or six fields).
    pub fn cron(
        name: impl Into<String>,
        expression: impl Into<String>,
        command: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        let mut task = Self::blank(name, command, body);
        task.cron_expression = Some(expression.into());
        task
    }

    /// Target an API request type instead of a command.
    pub fn for_request(mut self, request: impl Into<String>) -> Self {
        self.request_type = RequestKind::Api;
        self.request = Some(request.into());
        self.command = None;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// The cron expression wins when both a cron expression and an interval are set.
    pub fn schedule(&self) -> JobsResult<TaskSchedule> {
        if let Some(expression) = self.cron_expression.as_deref().filter(|e| !e.trim().is_empty())
        {
            return parse_cron(expression).map(TaskSchedule::Cron);
        }
        match self.interval {
            Some(every) if !every.is_zero() => Ok(TaskSchedule::Interval(every)),
            Some(_) => Err(JobsError::Validation(format!(
                "task '{}' has a zero interval",
                self.name
            ))),
            None => Err(JobsError::Validation(format!(
                "task '{}' needs an interval or a cron expression",
                self.name
            ))),
        }
    }

    pub fn validate(&self) -> JobsResult<()> {
        if self.name.trim().is_empty() {
            return Err(JobsError::Validation("task name is required".into()));
        }
        self.schedule()?;
        self.to_job().validate()
    }

    /// Next time the task is due, or `None` if it has never run and is due now.
    pub fn next_fire(&self) -> JobsResult<Option<DateTime<Utc>>> {
        let Some(last_run) = self.last_run else {
            return Ok(None);
        };
        match self.schedule()? {
            TaskSchedule::Interval(every) => {
                let every = chrono::Duration::from_std(every).map_err(|_| {
                    JobsError::Validation(format!("task '{}' interval is too large", self.name))
                })?;
                Ok(Some(last_run + every))
            }
            TaskSchedule::Cron(schedule) => {
                schedule.after(&last_run).next().map(Some).ok_or_else(|| {
                    JobsError::Validation(format!("task '{}' never fires again", self.name))
                })
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> JobsResult<bool> {
        Ok(self.next_fire()?.is_none_or(|next| next <= now))
    }

    /// The job this task enqueues, before options are applied.
    pub fn to_job(&self) -> BackgroundJob {
        let mut job = match self.request_type {
            RequestKind::Command => BackgroundJob::command(
                self.command.clone().unwrap_or_default(),
                self.request_body.clone(),
            ),
            RequestKind::Api => BackgroundJob::api(
                self.request.clone().unwrap_or_default(),
                self.request_body.clone(),
            ),
        };
        job.created_by = Some(format!("task:{}", self.name));
        job.meta.insert("scheduled_task".into(), self.name.clone());
        job
    }
}

/// Parse a cron expression. Standard five-field expressions get a leading
/// seconds field of `0`; six and seven field forms and `@daily` style macros
/// are passed through.
pub fn parse_cron(expression: &str) -> JobsResult<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| JobsError::Validation(format!("invalid cron expression '{expression}': {e}")))
}

/// A task that produced a job on this tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiredTask {
    pub task: String,
    pub job: JobRef,
}

/// Turns due scheduled tasks into queued jobs.
///
/// Each fire is guarded by a compare-and-swap on the task's `last_run`, so
/// several materializers sharing a store enqueue each occurrence once.
pub struct Materializer {
    store: Arc<dyn JobStore>,
    intake: Arc<JobIntake>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer").finish_non_exhaustive()
    }
}

impl Materializer {
    pub fn new(intake: Arc<JobIntake>) -> Self {
        Self {
            store: intake.store().clone(),
            intake,
        }
    }

    /// Fire every task due at `now`. A failing task is logged and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> JobsResult<Vec<FiredTask>> {
        let mut fired = Vec::new();
        for task in self.store.tasks().await? {
            match task.is_due(now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(task = %task.name, "skipping scheduled task: {err}");
                    continue;
                }
            }

            let span = crate::telemetry::task_fire_span(&task.name);
            match self.fire(&task, now).instrument(span).await {
                Ok(Some(job)) => fired.push(FiredTask {
                    task: task.name.clone(),
                    job,
                }),
                Ok(None) => {}
                Err(err) => tracing::warn!(task = %task.name, "scheduled task failed to fire: {err}"),
            }
        }
        Ok(fired)
    }

    async fn fire(&self, task: &ScheduledTask, now: DateTime<Utc>) -> JobsResult<Option<JobRef>> {
        let job = self.intake.submit(task.to_job(), &task.options).await?;

        if self
            .store
            .record_task_run(task.id, task.last_run, now, job.id)
            .await?
        {
            crate::telemetry::record_task_fired(&task.name);
            self.intake.events().emit(
                &job,
                JobEventPayload::TaskFired {
                    task: task.name.clone(),
                    job_id: job.id,
                },
            );
            return Ok(Some(job.job_ref()));
        }

        // Another materializer recorded this occurrence first.
        tracing::debug!(task = %task.name, job_id = %job.id, "lost task run race, cancelling duplicate");
        let error = JobError::new(ErrorCode::Cancelled, "duplicate scheduled run");
        let cancelled = self
            .store
            .transition(
                job.id,
                &[JobState::Queued],
                JobState::Cancelled,
                JobPatch::new().error(error),
            )
            .await?;
        if cancelled.applied().is_some() {
            self.store.move_to_terminal(job.id).await?;
        }
        Ok(None)
    }

    /// Tick every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancelToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Materializer shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.tick(Utc::now()).await {
                        tracing::warn!("materializer tick error: {err}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::persistence::InMemoryJobStore;
    use crate::store::JobQuery;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn materializer() -> (Arc<InMemoryJobStore>, Materializer) {
        let store = Arc::new(InMemoryJobStore::new());
        let intake = Arc::new(JobIntake::new(
            store.clone(),
            Arc::new(InProcEventBus::default()),
            2,
        ));
        (store, Materializer::new(intake))
    }

    #[test]
    fn test_five_field_cron_is_normalized() {
        let schedule = parse_cron("*/5 * * * *").unwrap();
        let next = schedule.after(&at(0)).next().unwrap();
        assert_eq!(next, at(300));
        assert!(parse_cron("0 0 * * * *").is_ok());
        assert!(parse_cron("@hourly").is_ok());
        assert!(matches!(parse_cron("not a cron"), Err(JobsError::Validation(_))));
    }

    #[test]
    fn test_validate_requires_schedule_and_handler() {
        let task = ScheduledTask::interval("t", Duration::ZERO, "Echo", json!({}));
        assert!(task.validate().is_err());

        let mut task = ScheduledTask::interval("t", Duration::from_secs(60), "Echo", json!({}));
        assert!(task.validate().is_ok());
        task.command = None;
        assert!(task.validate().is_err());

        let task = ScheduledTask::cron("c", "bogus", "Echo", json!({}));
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_cron_wins_over_interval() {
        let mut task = ScheduledTask::interval("t", Duration::from_secs(7), "Echo", json!({}));
        task.cron_expression = Some("0 * * * *".into());
        assert!(matches!(task.schedule().unwrap(), TaskSchedule::Cron(_)));
    }

    #[test]
    fn test_never_run_task_is_due_immediately() {
        let mut task = ScheduledTask::interval("t", Duration::from_secs(60), "Echo", json!({}));
        assert_eq!(task.next_fire().unwrap(), None);
        assert!(task.is_due(at(0)).unwrap());

        task.last_run = Some(at(0));
        assert_eq!(task.next_fire().unwrap(), Some(at(60)));
        assert!(!task.is_due(at(59)).unwrap());
        assert!(task.is_due(at(60)).unwrap());
    }

    #[tokio::test]
    async fn test_interval_task_fires_once_per_period() {
        let (store, materializer) = materializer();
        store
            .upsert_task(ScheduledTask::interval(
                "heartbeat",
                Duration::from_secs(60),
                "Echo",
                json!({"ping": true}),
            ))
            .await
            .unwrap();

        assert_eq!(materializer.tick(at(0)).await.unwrap().len(), 1);
        assert!(materializer.tick(at(30)).await.unwrap().is_empty());
        assert_eq!(materializer.tick(at(61)).await.unwrap().len(), 1);

        let jobs = store.query_live(&JobQuery::all()).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.created_by.as_deref() == Some("task:heartbeat")));
        let task = store.task("heartbeat").await.unwrap().unwrap();
        assert_eq!(task.last_run, Some(at(61)));
        assert_eq!(task.last_job_id, Some(jobs[1].id));
    }

    #[tokio::test]
    async fn test_lost_race_cancels_duplicate_job() {
        let (store, materializer) = materializer();
        let task = store
            .upsert_task(ScheduledTask::interval(
                "nightly",
                Duration::from_secs(60),
                "Echo",
                json!({}),
            ))
            .await
            .unwrap();

        // A peer records the run between our read and our CAS.
        assert!(
            store
                .record_task_run(task.id, None, at(0), JobId(999))
                .await
                .unwrap()
        );
        let fired = materializer.fire(&task, at(0)).await.unwrap();
        assert_eq!(fired, None);

        let live = store.query_live(&JobQuery::all()).await.unwrap();
        assert!(live.is_empty());
        let cancelled = store.get(JobId(1)).await.unwrap().unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_options_flow_into_job() {
        let (store, materializer) = materializer();
        store
            .upsert_task(
                ScheduledTask::interval("mail", Duration::from_secs(5), "Send", json!({}))
                    .with_options(JobOptions::new().with_worker("mail").with_retry_limit(0)),
            )
            .await
            .unwrap();
        materializer.tick(at(0)).await.unwrap();
        let job = store.get(JobId(1)).await.unwrap().unwrap();
        assert_eq!(job.pool(), "mail");
        assert_eq!(job.retry_limit, 0);
    }
}
