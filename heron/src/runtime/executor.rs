use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;

use crate::error::{ErrorCode, JobsResult};
use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{BackgroundJob, JobError, JobState};
use crate::retry::{RetryDecision, RetryPolicy, compute_backoff};
use crate::store::{JobPatch, JobStore, Transition};

use super::cancel::{CancelRegistry, CancelToken};
use super::registry::{CommandRegistry, JobContext};
use super::worker::{AttemptResult, WorkerStatsRegistry};

/// How a handler run ended, before the result is written back.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Completed { response: Option<serde_json::Value> },
    Failed { error: JobError },
    Cancelled,
    TimedOut { timeout_secs: u64 },
}

impl ExecutionOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::Failed { .. } => "failed",
            ExecutionOutcome::Cancelled => "cancelled",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
        }
    }
}

/// Runs claimed jobs: resolves the handler, enforces the timeout and settles
/// the result through the store's compare-and-swap transitions.
pub struct WorkerExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<CommandRegistry>,
    events: Arc<InProcEventBus>,
    retry: RetryPolicy,
    cancels: Arc<CancelRegistry>,
    stats: Arc<WorkerStatsRegistry>,
    default_timeout_secs: u64,
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("default_timeout_secs", &self.default_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl WorkerExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<CommandRegistry>,
        events: Arc<InProcEventBus>,
        retry: RetryPolicy,
        cancels: Arc<CancelRegistry>,
        stats: Arc<WorkerStatsRegistry>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            retry,
            cancels,
            stats,
            default_timeout_secs,
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn cancels(&self) -> &Arc<CancelRegistry> {
        &self.cancels
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout_secs(&self, job: &BackgroundJob) -> u64 {
        job.timeout_secs.unwrap_or(self.default_timeout_secs).max(1)
    }

    /// Execute a job the dispatcher just moved to `Started` and write back
    /// the result.
    pub async fn run(&self, job: BackgroundJob) -> ExecutionOutcome {
        let handler_name = job.handler_key().unwrap_or_default().to_string();
        let span = crate::telemetry::job_execute_span(job.id, &handler_name, job.attempts);
        async {
            let token = self.cancels.register(job.id);
            self.stats
                .record_start(job.pool(), job.id, job.started_date.unwrap_or_else(Utc::now));
            self.events.emit(
                &job,
                JobEventPayload::Claimed {
                    job_id: job.id,
                    attempt: job.attempts,
                },
            );

            let outcome = self.invoke(&job, &handler_name, token).await;
            if let Err(err) = self.settle(&job, outcome.clone()).await {
                tracing::error!(job_id = %job.id, "failed to record job outcome: {err}");
            }
            self.cancels.remove(job.id);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn invoke(
        &self,
        job: &BackgroundJob,
        handler_name: &str,
        token: CancelToken,
    ) -> ExecutionOutcome {
        let Some(handler) = self.registry.get(handler_name) else {
            return ExecutionOutcome::Failed {
                error: JobError::new(
                    ErrorCode::NotFound,
                    format!("no handler registered for '{handler_name}'"),
                ),
            };
        };

        let parent = match job.parent_id {
            Some(parent_id) => match self.store.get(parent_id).await {
                Ok(parent) => parent.map(Arc::new),
                Err(err) => {
                    tracing::warn!(job_id = %job.id, parent_id = %parent_id, "parent lookup failed: {err}");
                    None
                }
            },
            None => None,
        };

        let ctx = JobContext::new(
            Arc::new(job.clone()),
            parent,
            self.store.clone(),
            self.events.clone(),
            token.clone(),
        );
        let payload = job.request_body.clone();

        let timeout_secs = self.timeout_secs(job);
        let elapsed = job
            .started_date
            .map(|started| (Utc::now() - started).to_std().unwrap_or_default())
            .unwrap_or_default();
        let remaining = Duration::from_secs(timeout_secs).saturating_sub(elapsed);

        let mut handle = tokio::spawn(async move { handler.execute(ctx, payload).await });
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(response)) => ExecutionOutcome::Completed { response },
                Ok(Err(err)) => {
                    let error = JobError::from_handler(&err);
                    if error.error_code == ErrorCode::Cancelled && token.is_cancelled() {
                        ExecutionOutcome::Cancelled
                    } else {
                        ExecutionOutcome::Failed { error }
                    }
                }
                Err(join_err) => ExecutionOutcome::Failed {
                    error: JobError::new(
                        ErrorCode::ExecutionFailed,
                        format!("handler panicked: {join_err}"),
                    ),
                },
            },
            _ = tokio::time::sleep(remaining) => {
                handle.abort();
                ExecutionOutcome::TimedOut { timeout_secs }
            }
        }
    }

    async fn settle(&self, job: &BackgroundJob, outcome: ExecutionOutcome) -> JobsResult<()> {
        match outcome {
            ExecutionOutcome::Completed { response } => {
                if self.cancels.was_requested(job.id) {
                    self.record_ignored_cancel(job).await?;
                }
                let patch = JobPatch {
                    clear_error: true,
                    ..JobPatch::new().response(response.clone())
                };
                if job.callback.is_some() {
                    let Some(executed) = self
                        .store
                        .transition(job.id, &[JobState::Started], JobState::Executed, patch)
                        .await?
                        .applied()
                    else {
                        tracing::warn!(job_id = %job.id, "job settled elsewhere before completion");
                        return Ok(());
                    };
                    return self.complete_executed(executed).await;
                }
                match self
                    .store
                    .transition(job.id, &[JobState::Started], JobState::Completed, patch)
                    .await?
                {
                    Transition::Applied(done) => self.finish_completed(done).await.map(|_| ()),
                    other => {
                        tracing::warn!(job_id = %job.id, ?other, "job settled elsewhere before completion");
                        Ok(())
                    }
                }
            }
            ExecutionOutcome::Cancelled => {
                let error = JobError::new(ErrorCode::Cancelled, "cancelled while running");
                let Some(cancelled) = self
                    .store
                    .transition(
                        job.id,
                        &[JobState::Started],
                        JobState::Cancelled,
                        JobPatch::new().error(error).log("cancelled"),
                    )
                    .await?
                    .applied()
                else {
                    return Ok(());
                };
                let archived = self.store.move_to_terminal(cancelled.id).await?;
                crate::telemetry::record_job_finished(
                    archived.pool(),
                    archived.handler_key().unwrap_or_default(),
                    "cancelled",
                    archived.duration_ms,
                );
                self.stats.record_finish(
                    archived.pool(),
                    archived.id,
                    AttemptResult::Cancelled,
                    archived.duration_ms,
                );
                self.events
                    .emit(&archived, JobEventPayload::Cancelled { job_id: archived.id });
                Ok(())
            }
            ExecutionOutcome::TimedOut { timeout_secs } => {
                tracing::warn!(job_id = %job.id, timeout_secs, "job timed out");
                self.events.emit(
                    job,
                    JobEventPayload::TimedOut {
                        job_id: job.id,
                        timeout_secs,
                    },
                );
                let error = JobError::new(
                    ErrorCode::Timeout,
                    format!("job exceeded its {timeout_secs}s timeout"),
                );
                self.fail_job(job, error).await.map(|_| ())
            }
            ExecutionOutcome::Failed { error } => self.fail_job(job, error).await.map(|_| ()),
        }
    }

    async fn record_ignored_cancel(&self, job: &BackgroundJob) -> JobsResult<()> {
        let error = JobError::new(
            ErrorCode::Cancelled,
            "cancel requested while running; the handler completed anyway",
        );
        self.cancels.record_ineffective(job.id, error);
        self.store
            .update(job.id, JobPatch::new().log("cancel request ignored by handler"))
            .await?;
        tracing::warn!(job_id = %job.id, "cancel request ignored by handler");
        self.events
            .emit(job, JobEventPayload::CancelIgnored { job_id: job.id });
        Ok(())
    }

    /// Complete an `Executed` job, then notify its callback in the
    /// background. The callback never delays completion or reopens the job.
    pub async fn complete_executed(&self, job: BackgroundJob) -> JobsResult<()> {
        match self
            .store
            .transition(job.id, &[JobState::Executed], JobState::Completed, JobPatch::new())
            .await?
        {
            Transition::Applied(done) => {
                let archived = self.finish_completed(done).await?;
                self.spawn_callback(archived);
                Ok(())
            }
            other => {
                tracing::warn!(job_id = %job.id, ?other, "executed job settled elsewhere");
                Ok(())
            }
        }
    }

    /// Fire the callback of a completed job that has not been notified yet.
    pub(crate) fn spawn_callback(&self, job: BackgroundJob) {
        let Some(callback) = job.callback.clone() else {
            return;
        };
        if job.notified_date.is_some() {
            return;
        }
        let notifier = CallbackNotifier {
            store: self.store.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            retry: self.retry.clone(),
            timeout: Duration::from_secs(self.timeout_secs(&job)),
        };
        let span = crate::telemetry::job_callback_span(job.id, &callback);
        tokio::spawn(async move { notifier.notify(job, &callback).await }.instrument(span));
    }

    async fn finish_completed(&self, done: BackgroundJob) -> JobsResult<BackgroundJob> {
        let archived = self.store.move_to_terminal(done.id).await?;
        crate::telemetry::record_job_finished(
            archived.pool(),
            archived.handler_key().unwrap_or_default(),
            "completed",
            archived.duration_ms,
        );
        self.stats.record_finish(
            archived.pool(),
            archived.id,
            AttemptResult::Completed,
            archived.duration_ms,
        );
        self.events.emit(
            &archived,
            JobEventPayload::Completed {
                job_id: archived.id,
                duration_ms: archived.duration_ms,
            },
        );
        Ok(archived)
    }

    /// Fail the current attempt, then requeue or archive it per the retry
    /// policy. Returns `None` when the job had already left `Started` or
    /// `Executed`, in which case nothing is written.
    pub async fn fail_job(
        &self,
        job: &BackgroundJob,
        error: JobError,
    ) -> JobsResult<Option<BackgroundJob>> {
        let line = format!("attempt {} failed: {}", job.attempts, error.message);
        let failed = match self
            .store
            .transition(
                job.id,
                &[JobState::Started, JobState::Executed],
                JobState::Failed,
                JobPatch::new().error(error.clone()).log(line),
            )
            .await?
        {
            Transition::Applied(failed) => failed,
            Transition::Conflict { actual } => {
                tracing::debug!(job_id = %job.id, state = %actual, "failure already settled");
                return Ok(None);
            }
            Transition::Missing => return Ok(None),
        };

        let handler = failed.handler_key().unwrap_or_default().to_string();
        match self.retry.on_failure(&failed, &error, Utc::now()) {
            RetryDecision::Requeue {
                run_after,
                delay_ms,
            } => {
                let Some(requeued) = self
                    .store
                    .transition(
                        failed.id,
                        &[JobState::Failed],
                        JobState::Queued,
                        JobPatch::new().run_after(run_after),
                    )
                    .await?
                    .applied()
                else {
                    return Ok(None);
                };
                crate::telemetry::record_job_retried(
                    requeued.pool(),
                    &handler,
                    requeued.attempts,
                    delay_ms,
                );
                self.stats.record_finish(
                    requeued.pool(),
                    requeued.id,
                    AttemptResult::Retried,
                    failed.duration_ms,
                );
                self.events.emit(
                    &requeued,
                    JobEventPayload::Retried {
                        job_id: requeued.id,
                        attempt: requeued.attempts,
                        run_after,
                    },
                );
                Ok(Some(requeued))
            }
            RetryDecision::TerminalFail => {
                let archived = self.store.move_to_terminal(failed.id).await?;
                crate::telemetry::record_job_finished(
                    archived.pool(),
                    &handler,
                    "failed",
                    archived.duration_ms,
                );
                self.stats.record_finish(
                    archived.pool(),
                    archived.id,
                    AttemptResult::Failed,
                    archived.duration_ms,
                );
                self.events.emit(
                    &archived,
                    JobEventPayload::Failed {
                        job_id: archived.id,
                        code: error.error_code,
                    },
                );
                Ok(Some(archived))
            }
        }
    }
}

/// Delivers a completed job's response to its callback handler, retrying
/// with backoff, and records the outcome on the archived record.
struct CallbackNotifier {
    store: Arc<dyn JobStore>,
    registry: Arc<CommandRegistry>,
    events: Arc<InProcEventBus>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl CallbackNotifier {
    async fn notify(&self, job: BackgroundJob, callback: &str) {
        let patch = if self.deliver(&job, callback).await {
            JobPatch {
                notified_date: Some(Utc::now()),
                ..JobPatch::new()
            }
        } else {
            JobPatch::new().log(format!("callback '{callback}' failed"))
        };
        if let Err(err) = self.store.update_archived(job.id, patch).await {
            tracing::error!(job_id = %job.id, callback, "failed to record callback result: {err}");
        }
    }

    async fn deliver(&self, job: &BackgroundJob, callback: &str) -> bool {
        let Some(handler) = self.registry.get(callback) else {
            tracing::warn!(job_id = %job.id, callback, "no handler registered for callback");
            return false;
        };
        let payload = job.response_body.clone().unwrap_or(serde_json::Value::Null);
        let job = Arc::new(job.clone());

        for attempt in 1..=job.retry_limit + 1 {
            let ctx = JobContext::new(
                job.clone(),
                None,
                self.store.clone(),
                self.events.clone(),
                CancelToken::new(),
            );
            match tokio::time::timeout(self.timeout, handler.execute(ctx, payload.clone())).await {
                Ok(Ok(_)) => return true,
                Ok(Err(err)) => {
                    tracing::warn!(job_id = %job.id, callback, attempt, "callback failed: {err:#}");
                }
                Err(_) => {
                    tracing::warn!(job_id = %job.id, callback, attempt, "callback timed out");
                }
            }
            if attempt <= job.retry_limit {
                let delay = compute_backoff(attempt, self.retry.config());
                tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::JobsError;
    use crate::job::{JobId, JobLocation, JobOptions};
    use crate::persistence::InMemoryJobStore;
    use crate::store::ClaimRequest;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        executor: WorkerExecutor,
    }

    fn harness(registry: CommandRegistry) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = WorkerExecutor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(InProcEventBus::default()),
            RetryPolicy::new(RetryConfig {
                base_delay_ms: 0,
                ..RetryConfig::default()
            }),
            Arc::new(CancelRegistry::new()),
            Arc::new(WorkerStatsRegistry::new()),
            5,
        );
        Harness { store, executor }
    }

    impl Harness {
        async fn claim(&self, job: BackgroundJob) -> BackgroundJob {
            let id = self.store.enqueue(job).await.unwrap().id;
            let outcome = self
                .store
                .claim_next(ClaimRequest::new("default", 10, Utc::now()))
                .await
                .unwrap();
            outcome.claimed.into_iter().find(|j| j.id == id).unwrap()
        }

        /// Poll the stored record until `done` holds.
        async fn wait_until(
            &self,
            id: JobId,
            done: impl Fn(&BackgroundJob) -> bool,
        ) -> BackgroundJob {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let job = self.store.get(id).await.unwrap().unwrap();
                    if done(&job) {
                        break job;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("condition should hold within 5s")
        }
    }

    #[tokio::test]
    async fn test_success_archives_with_response() {
        let mut registry = CommandRegistry::new();
        registry.register_fn("Echo", |_ctx, payload| async move { Ok(Some(payload)) });
        let h = harness(registry);

        let job = h.claim(BackgroundJob::command("Echo", json!({"a": 1}))).await;
        let outcome = h.executor.run(job.clone()).await;
        assert_eq!(outcome.status(), "completed");

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.location, JobLocation::Completed);
        assert_eq!(stored.response_body, Some(json!({"a": 1})));
        assert_eq!(stored.response.as_deref(), Some("object"));
        assert_eq!(stored.progress, 1.0);
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_without_retry() {
        let h = harness(CommandRegistry::new());
        let job = h.claim(BackgroundJob::command("Nope", json!({}))).await;
        h.executor.run(job.clone()).await;

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.error_code, Some(ErrorCode::NotFound));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_requeues_until_limit() {
        let mut registry = CommandRegistry::new();
        registry.register_fn("Boom", |_ctx, _payload| async move {
            Err(anyhow::anyhow!("boom"))
        });
        let h = harness(registry);

        let job = BackgroundJob::command("Boom", json!({})).with_options(&JobOptions::new().with_retry_limit(1));
        let first = h.claim(job).await;
        h.executor.run(first.clone()).await;
        let requeued = h.store.get(first.id).await.unwrap().unwrap();
        assert_eq!(requeued.state, JobState::Queued);
        assert_eq!(requeued.error_code, Some(ErrorCode::ExecutionFailed));

        let second = h
            .store
            .claim_next(ClaimRequest::new("default", 1, Utc::now() + chrono::Duration::seconds(1)))
            .await
            .unwrap()
            .claimed
            .remove(0);
        assert_eq!(second.attempts, 2);
        h.executor.run(second).await;
        let failed = h.store.get(first.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.location, JobLocation::Failed);
        assert_eq!(failed.attempts, 2);
    }

    #[tokio::test]
    async fn test_timeout_aborts_handler() {
        let mut registry = CommandRegistry::new();
        registry.register_fn("Slow", |_ctx, _payload| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        });
        let h = harness(registry);

        let job = BackgroundJob::command("Slow", json!({}))
            .with_options(&JobOptions::new().with_timeout_secs(1).with_retry_limit(0));
        let job = h.claim(job).await;
        let started = std::time::Instant::now();
        let outcome = h.executor.run(job.clone()).await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut { timeout_secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.error_code, Some(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn test_cooperative_cancel() {
        let mut registry = CommandRegistry::new();
        registry.register_fn("Wait", |ctx, _payload| async move {
            ctx.cancelled().await;
            ctx.check_cancelled()?;
            Ok(None)
        });
        let h = Arc::new(harness(registry));

        let job = h.claim(BackgroundJob::command("Wait", json!({}))).await;
        let id = job.id;
        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.executor.run(job).await })
        };
        while !h.executor.cancels().request(id) {
            tokio::task::yield_now().await;
        }
        assert_eq!(runner.await.unwrap(), ExecutionOutcome::Cancelled);

        let stored = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Cancelled);
        assert_eq!(stored.error_code, Some(ErrorCode::Cancelled));
    }

    #[tokio::test]
    async fn test_callback_receives_response() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let mut registry = CommandRegistry::new();
        registry.register_fn("Work", |_ctx, _payload| async move { Ok(Some(json!("done"))) });
        {
            let seen = seen.clone();
            registry.register_fn("Notify", move |_ctx, payload| {
                let seen = seen.clone();
                async move {
                    *seen.lock() = Some(payload);
                    Ok(None)
                }
            });
        }
        let h = harness(registry);

        let job = BackgroundJob::command("Work", json!({}))
            .with_options(&JobOptions::new().with_callback("Notify"));
        let job = h.claim(job).await;
        h.executor.run(job.clone()).await;

        let stored = h.wait_until(job.id, |j| j.notified_date.is_some()).await;
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(*seen.lock(), Some(json!("done")));
    }

    #[tokio::test]
    async fn test_completion_does_not_wait_for_callback() {
        let mut registry = CommandRegistry::new();
        registry.register_fn("Work", |_ctx, _payload| async move { Ok(None) });
        registry.register_fn("Notify", |_ctx, _payload| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(None)
        });
        let h = harness(registry);

        let job = BackgroundJob::command("Work", json!({}))
            .with_options(&JobOptions::new().with_callback("Notify"));
        let job = h.claim(job).await;
        let started = std::time::Instant::now();
        h.executor.run(job.clone()).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.location, JobLocation::Completed);
        assert!(stored.notified_date.is_none());
    }

    #[tokio::test]
    async fn test_failed_callback_still_completes() {
        let mut registry = CommandRegistry::new();
        registry.register_fn("Work", |_ctx, _payload| async move { Ok(None) });
        registry.register_fn("Notify", |_ctx, _payload| async move {
            Err(JobsError::Validation("bad".into()).into())
        });
        let h = harness(registry);

        let job = BackgroundJob::command("Work", json!({}))
            .with_options(&JobOptions::new().with_callback("Notify").with_retry_limit(0));
        let job = h.claim(job).await;
        h.executor.run(job.clone()).await;

        let stored = h
            .wait_until(job.id, |j| j.logs.contains("callback 'Notify' failed"))
            .await;
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.location, JobLocation::Completed);
        assert!(stored.notified_date.is_none());
    }

    #[tokio::test]
    async fn test_fail_job_is_noop_once_settled() {
        let h = harness(CommandRegistry::new());
        let job = h.claim(BackgroundJob::command("X", json!({}))).await;
        h.store
            .transition(job.id, &[JobState::Started], JobState::Completed, JobPatch::new())
            .await
            .unwrap();
        let result = h
            .executor
            .fail_job(&job, JobError::new(ErrorCode::Timeout, "late"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(
            h.store.get(job.id).await.unwrap().unwrap().state,
            JobState::Completed
        );
        assert!(h.store.get(JobId(99)).await.unwrap().is_none());
    }
}
