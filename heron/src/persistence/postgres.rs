use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
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

/// Upper bound on queued rows examined per claim. Rows whose dependency is
/// still live are filtered out in SQL, so every row in the window is either
/// claimable or can be failed; the window only bounds one pass.
const CLAIM_WINDOW: i64 = 500;

const SCHEMA: &str = include_str!("../../migrations/0001_heron_jobs.sql");

/// PostgreSQL-backed job store.
///
/// Each table keeps the full record as JSONB next to the columns used for
/// filtering and ordering. Claims lock candidate rows with
/// `FOR UPDATE SKIP LOCKED`, so concurrent coordinators never start the
/// same job.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they don't exist yet.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode<T: serde::de::DeserializeOwned>(row: &PgRow) -> JobsResult<T> {
        let data: serde_json::Value = row.try_get("data")?;
        serde_json::from_value(data).map_err(|e| JobsError::Store(e.into()))
    }

    fn encode<T: serde::Serialize>(value: &T) -> JobsResult<serde_json::Value> {
        serde_json::to_value(value).map_err(|e| JobsError::Store(e.into()))
    }

    fn decode_task(row: &PgRow) -> JobsResult<ScheduledTask> {
        let mut task: ScheduledTask = Self::decode(row)?;
        task.id = row.try_get("id")?;
        task.last_run = row.try_get("last_run")?;
        task.last_job_id = row.try_get::<Option<i64>, _>("last_job_id")?.map(JobId);
        Ok(task)
    }

    fn archive_table(location: JobLocation) -> &'static str {
        match location {
            JobLocation::Completed => "heron_completed_jobs",
            _ => "heron_failed_jobs",
        }
    }

    async fn lock_live(conn: &mut PgConnection, id: JobId) -> JobsResult<Option<BackgroundJob>> {
        let row = sqlx::query("SELECT data FROM heron_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn write_live(conn: &mut PgConnection, job: &BackgroundJob) -> JobsResult<()> {
        sqlx::query(
            r#"
            UPDATE heron_jobs
            SET state = $2, run_after = $3, worker = $4, data = $5
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.state.as_str())
        .bind(job.run_after)
        .bind(job.pool())
        .bind(Self::encode(job)?)
        .execute(&mut *conn)
        .await?;
        Self::write_summary(conn, job).await
    }

    async fn insert_live(conn: &mut PgConnection, job: &BackgroundJob) -> JobsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO heron_jobs (id, ref_id, worker, state, run_after, created_date, depends_on, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.ref_id)
        .bind(job.pool())
        .bind(job.state.as_str())
        .bind(job.run_after)
        .bind(job.created_date)
        .bind(job.depends_on.map(|d| d.0))
        .bind(Self::encode(job)?)
        .execute(&mut *conn)
        .await?;
        Self::write_summary(conn, job).await
    }

    async fn write_summary(conn: &mut PgConnection, job: &BackgroundJob) -> JobsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO heron_job_summaries (id, ref_id, worker, state, created_date, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET worker = EXCLUDED.worker, state = EXCLUDED.state, data = EXCLUDED.data
            "#,
        )
        .bind(job.id.0)
        .bind(&job.ref_id)
        .bind(job.pool())
        .bind(job.state.as_str())
        .bind(job.created_date)
        .bind(Self::encode(&job.summary())?)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn fetch_archived(&self, id: JobId) -> JobsResult<Option<BackgroundJob>> {
        for table in ["heron_completed_jobs", "heron_failed_jobs"] {
            let row = sqlx::query(&format!("SELECT data FROM {table} WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return Self::decode(&row).map(Some);
            }
        }
        Ok(None)
    }

    async fn query_archive(
        &self,
        table: &str,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        let rows = sqlx::query(&format!(
            "SELECT data FROM {table} WHERE month = $1 ORDER BY id"
        ))
        .bind(month.to_string())
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows
            .iter()
            .map(Self::decode::<BackgroundJob>)
            .collect::<JobsResult<Vec<_>>>()?;
        Ok(query.paginate(jobs.into_iter().filter(|job| query.matches(job))))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, mut job: BackgroundJob) -> JobsResult<BackgroundJob> {
        job.validate()?;
        let mut tx = self.pool.begin().await?;

        if let Some(dependency) = job.depends_on {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM heron_job_summaries WHERE id = $1")
                    .bind(dependency.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            match state.as_deref() {
                None => {
                    return Err(JobsError::NotFound(format!(
                        "dependency job {dependency}"
                    )));
                }
                Some("Completed") if job.parent_id.is_none() => {
                    job.parent_id = Some(dependency);
                }
                Some(_) => {}
            }
        }

        job.state = JobState::Queued;
        job.attempts = 0;
        job.location = JobLocation::Live;
        job.last_activity_date = Utc::now();

        let id: i64 = sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('heron_jobs', 'id'))")
            .fetch_one(&mut *tx)
            .await?;
        job.id = JobId(id);
        Self::insert_live(&mut tx, &job).await?;
        tx.commit().await?;

        debug!(job_id = %job.id, pool = job.pool(), "job stored");
        Ok(job)
    }

    async fn get(&self, id: JobId) -> JobsResult<Option<BackgroundJob>> {
        let row = sqlx::query("SELECT data FROM heron_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::decode(&row).map(Some),
            None => self.fetch_archived(id).await,
        }
    }

    async fn get_by_ref_id(&self, ref_id: &str) -> JobsResult<Option<BackgroundJob>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM heron_job_summaries WHERE ref_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(ref_id)
        .fetch_optional(&self.pool)
        .await?;
        match id {
            Some(id) => self.get(JobId(id)).await,
            None => Ok(None),
        }
    }

    async fn summary(&self, id: JobId) -> JobsResult<Option<JobSummary>> {
        let row = sqlx::query("SELECT data FROM heron_job_summaries WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn claim_next(&self, request: ClaimRequest) -> JobsResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT j.data
            FROM heron_jobs j
            WHERE j.state = 'Queued'
              AND j.worker = $1
              AND (j.run_after IS NULL OR j.run_after <= $2)
              AND NOT EXISTS (
                  SELECT 1 FROM heron_jobs p
                  WHERE p.id = j.depends_on
                    AND p.state NOT IN ('Completed', 'Cancelled')
              )
            ORDER BY COALESCE(j.run_after, j.created_date), j.id
            LIMIT $3
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(&request.pool)
        .bind(request.now)
        .bind(CLAIM_WINDOW)
        .fetch_all(&mut *tx)
        .await?;

        let candidates = rows
            .iter()
            .map(Self::decode::<BackgroundJob>)
            .collect::<JobsResult<Vec<_>>>()?;

        let dependency_ids: Vec<i64> = candidates
            .iter()
            .filter_map(|job| job.depends_on.map(|d| d.0))
            .collect();
        let mut states: HashMap<JobId, JobState> = HashMap::new();
        if !dependency_ids.is_empty() {
            let rows = sqlx::query(
                r#"
                SELECT s.id, s.state, (j.id IS NOT NULL) AS live
                FROM heron_job_summaries s
                LEFT JOIN heron_jobs j ON j.id = s.id
                WHERE s.id = ANY($1)
                "#,
            )
            .bind(&dependency_ids)
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let state: JobState = row.try_get::<String, _>("state")?.parse()?;
                let live: bool = row.try_get("live")?;
                // a live failed job is between attempts
                let state = if live && state == JobState::Failed {
                    JobState::Queued
                } else {
                    state
                };
                states.insert(JobId(row.try_get("id")?), state);
            }
        }

        let mut outcome = ClaimOutcome::default();
        for mut job in candidates {
            match DependencyGraph::evaluate(&job, request.now, |id| states.get(&id).copied()) {
                Eligibility::Ready if outcome.claimed.len() < request.limit => {
                    let patch = JobPatch {
                        parent_id: job.depends_on.filter(|_| job.parent_id.is_none()),
                        ..JobPatch::default()
                    };
                    apply_transition(&mut job, JobState::Started, &patch, request.now)?;
                    Self::write_live(&mut tx, &job).await?;
                    outcome.claimed.push(job);
                }
                blocked if blocked.is_permanent_failure() => {
                    let error = match blocked {
                        Eligibility::Blocked { on, state } => JobError::from(&JobsError::DependencyFailed {
                            job: job.id,
                            dependency: on,
                            state,
                        }),
                        _ => JobError::new(
                            ErrorCode::DependencyFailed,
                            "dependency job no longer exists",
                        ),
                    };
                    apply_transition(
                        &mut job,
                        JobState::Failed,
                        &JobPatch::new().error(error),
                        request.now,
                    )?;
                    Self::write_live(&mut tx, &job).await?;
                    outcome.dependency_failed.push(job);
                }
                _ => {}
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn transition(
        &self,
        id: JobId,
        expected: &[JobState],
        to: JobState,
        patch: JobPatch,
    ) -> JobsResult<Transition> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_live(&mut tx, id).await? else {
            return Ok(Transition::Missing);
        };
        if !expected.contains(&job.state) {
            return Ok(Transition::Conflict { actual: job.state });
        }
        apply_transition(&mut job, to, &patch, Utc::now())?;
        Self::write_live(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Transition::Applied(job))
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> JobsResult<Option<BackgroundJob>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_live(&mut tx, id).await? else {
            return Ok(None);
        };
        patch.apply(&mut job, Utc::now());
        Self::write_live(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn update_archived(
        &self,
        id: JobId,
        patch: JobPatch,
    ) -> JobsResult<Option<BackgroundJob>> {
        let mut tx = self.pool.begin().await?;
        for table in ["heron_completed_jobs", "heron_failed_jobs"] {
            let row = sqlx::query(&format!("SELECT data FROM {table} WHERE id = $1 FOR UPDATE"))
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                continue;
            };
            let mut job: BackgroundJob = Self::decode(&row)?;
            patch.apply(&mut job, Utc::now());
            sqlx::query(&format!("UPDATE {table} SET data = $2 WHERE id = $1"))
                .bind(id.0)
                .bind(Self::encode(&job)?)
                .execute(&mut *tx)
                .await?;
            Self::write_summary(&mut tx, &job).await?;
            tx.commit().await?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn move_to_terminal(&self, id: JobId) -> JobsResult<BackgroundJob> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_live(&mut tx, id)
            .await?
            .ok_or_else(|| JobsError::job_not_found(id))?;
        if !job.state.is_terminal() {
            return Err(JobsError::Validation(format!(
                "job {id} is {} and cannot be archived",
                job.state
            )));
        }

        job.location = if job.state == JobState::Completed {
            JobLocation::Completed
        } else {
            JobLocation::Failed
        };
        let table = Self::archive_table(job.location);
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, month, ref_id, worker, state, created_date, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#
        ))
        .bind(job.id.0)
        .bind(job.month().to_string())
        .bind(&job.ref_id)
        .bind(job.pool())
        .bind(job.state.as_str())
        .bind(job.created_date)
        .bind(Self::encode(&job)?)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM heron_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        Self::write_summary(&mut tx, &job).await?;
        tx.commit().await?;

        debug!(job_id = %id, table, "job archived");
        Ok(job)
    }

    async fn requeue_failed(&self, id: JobId) -> JobsResult<BackgroundJob> {
        let mut tx = self.pool.begin().await?;
        if let Some(job) = Self::lock_live(&mut tx, id).await? {
            return match job.state {
                JobState::Queued => Ok(job),
                from => Err(JobsError::InvalidTransition {
                    id,
                    from,
                    to: JobState::Queued,
                }),
            };
        }

        let row = sqlx::query("SELECT data FROM heron_failed_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            drop(tx);
            return match self.fetch_archived(id).await? {
                Some(job) => Err(JobsError::InvalidTransition {
                    id,
                    from: job.state,
                    to: JobState::Queued,
                }),
                None => Err(JobsError::job_not_found(id)),
            };
        };

        let mut job: BackgroundJob = Self::decode(&row)?;
        if job.state != JobState::Failed {
            return Err(JobsError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Queued,
            });
        }

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

        sqlx::query("DELETE FROM heron_failed_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        Self::insert_live(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn query_live(&self, query: &JobQuery) -> JobsResult<Vec<BackgroundJob>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM heron_jobs
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR worker = $2)
            ORDER BY id
            "#,
        )
        .bind(query.state.map(|s| s.as_str()))
        .bind(query.worker.as_deref())
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows
            .iter()
            .map(Self::decode::<BackgroundJob>)
            .collect::<JobsResult<Vec<_>>>()?;
        Ok(query.paginate(jobs.into_iter().filter(|job| query.matches(job))))
    }

    async fn query_summaries(&self, query: &JobQuery) -> JobsResult<Vec<JobSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM heron_job_summaries
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR worker = $2)
            ORDER BY id
            "#,
        )
        .bind(query.state.map(|s| s.as_str()))
        .bind(query.worker.as_deref())
        .fetch_all(&self.pool)
        .await?;
        let summaries = rows
            .iter()
            .map(Self::decode::<JobSummary>)
            .collect::<JobsResult<Vec<_>>>()?;
        Ok(query.paginate(summaries.into_iter().filter(|s| query.matches_summary(s))))
    }

    async fn query_completed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        self.query_archive("heron_completed_jobs", month, query).await
    }

    async fn query_failed(
        &self,
        month: MonthKey,
        query: &JobQuery,
    ) -> JobsResult<Vec<BackgroundJob>> {
        self.query_archive("heron_failed_jobs", month, query).await
    }

    async fn months(&self) -> JobsResult<Vec<MonthKey>> {
        let months: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT month FROM heron_completed_jobs
            UNION
            SELECT month FROM heron_failed_jobs
            ORDER BY month DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        months.iter().map(|m| m.parse()).collect()
    }

    async fn table_counts(&self) -> JobsResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for (name, table) in [
            ("jobs", "heron_jobs"),
            ("job_summaries", "heron_job_summaries"),
            ("completed_jobs", "heron_completed_jobs"),
            ("failed_jobs", "heron_failed_jobs"),
            ("scheduled_tasks", "heron_scheduled_tasks"),
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            counts.insert(name.to_string(), count.max(0) as usize);
        }
        Ok(counts)
    }

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> JobsResult<QueueSnapshot> {
        let rows = sqlx::query("SELECT data FROM heron_jobs")
            .fetch_all(&self.pool)
            .await?;
        let mut snapshot = QueueSnapshot::new(now);
        for row in &rows {
            snapshot.record(&Self::decode::<BackgroundJob>(row)?);
        }
        Ok(snapshot)
    }

    async fn pending_pools(&self, now: DateTime<Utc>) -> JobsResult<Vec<String>> {
        let pools = sqlx::query_scalar(
            r#"
            SELECT DISTINCT worker FROM heron_jobs
            WHERE state = 'Queued' AND (run_after IS NULL OR run_after <= $1)
            ORDER BY worker
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(pools)
    }

    async fn started_jobs(&self) -> JobsResult<Vec<BackgroundJob>> {
        let rows = sqlx::query(
            "SELECT data FROM heron_jobs WHERE state IN ('Started', 'Executed') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn upsert_task(&self, task: ScheduledTask) -> JobsResult<ScheduledTask> {
        task.validate()?;
        let row = sqlx::query(
            r#"
            INSERT INTO heron_scheduled_tasks (name, last_run, last_job_id, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET data = EXCLUDED.data,
                last_run = COALESCE(EXCLUDED.last_run, heron_scheduled_tasks.last_run),
                last_job_id = COALESCE(EXCLUDED.last_job_id, heron_scheduled_tasks.last_job_id)
            RETURNING id, last_run, last_job_id, data
            "#,
        )
        .bind(&task.name)
        .bind(task.last_run)
        .bind(task.last_job_id.map(|id| id.0))
        .bind(Self::encode(&task)?)
        .fetch_one(&self.pool)
        .await?;
        Self::decode_task(&row)
    }

    async fn delete_task(&self, name: &str) -> JobsResult<bool> {
        let result = sqlx::query("DELETE FROM heron_scheduled_tasks WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn task(&self, name: &str) -> JobsResult<Option<ScheduledTask>> {
        let row = sqlx::query(
            "SELECT id, last_run, last_job_id, data FROM heron_scheduled_tasks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode_task).transpose()
    }

    async fn tasks(&self) -> JobsResult<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT id, last_run, last_job_id, data FROM heron_scheduled_tasks ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode_task).collect()
    }

    async fn record_task_run(
        &self,
        task_id: i64,
        expected_last_run: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> JobsResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE heron_scheduled_tasks
            SET last_run = $3, last_job_id = $4
            WHERE id = $1 AND last_run IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(task_id)
        .bind(expected_last_run)
        .bind(run_at)
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(task_id, "scheduled task run already recorded by another materializer");
        }
        Ok(result.rows_affected() == 1)
    }
}
