use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::budget::Budget;
use crate::error::{JobsError, JobsResult};
use crate::events::{InProcEventBus, JobEvent, JobEventPayload, JobEventStream};
use crate::job::{JobId, JobState};
use crate::runtime::cancel::CancelToken;
use crate::runtime::executor::WorkerExecutor;
use crate::runtime::worker::{AttemptResult, WorkerStatsRegistry};
use crate::store::{ClaimRequest, JobPatch, JobStore};

/// Timing knobs for the dispatch loop.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Poll interval when nothing wakes the loop.
    pub tick_interval: Duration,
    /// Upper bound for the backoff applied after store errors.
    pub max_backoff: Duration,
    /// How long shutdown waits for running jobs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// What one dispatcher pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs claimed and handed to the executor.
    pub started: usize,
    /// Jobs failed because their dependency can never complete.
    pub dependency_failed: usize,
}

/// Claims due jobs pool by pool and runs them within each pool's
/// concurrency budget.
///
/// A pass is triggered by the poll interval, by wake-up events on the bus
/// (enqueue, retry, requeue, completion) and by a job releasing its slot.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    budget: Arc<dyn Budget>,
    executor: Arc<WorkerExecutor>,
    events: Arc<InProcEventBus>,
    stats: Arc<WorkerStatsRegistry>,
    config: DispatcherConfig,
    wake: Arc<Notify>,
    tick_lock: tokio::sync::Mutex<()>,
    inflight: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("inflight", &self.inflight.lock().len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        budget: Arc<dyn Budget>,
        executor: Arc<WorkerExecutor>,
        events: Arc<InProcEventBus>,
        stats: Arc<WorkerStatsRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            budget,
            executor,
            events,
            stats,
            config,
            wake: Arc::new(Notify::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(JoinSet::new()),
        }
    }

    /// Ask the loop for another pass.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Number of spawned job tasks not yet reaped.
    pub fn inflight(&self) -> usize {
        let mut inflight = self.inflight.lock();
        while inflight.try_join_next().is_some() {}
        inflight.len()
    }

    /// One dispatch pass over every pool with due work.
    pub async fn tick(&self, now: DateTime<Utc>) -> JobsResult<DispatchReport> {
        let _pass = self.tick_lock.lock().await;
        self.reap();

        let mut report = DispatchReport::default();
        let snapshot = self.store.queue_snapshot(now).await?;
        for (pool, entry) in &snapshot.pools {
            self.stats.set_queued(pool, entry.queued_count);
            crate::telemetry::set_queue_depth(pool, entry.queued_count);
        }

        for pool in self.store.pending_pools(now).await? {
            // a full pool still claims with limit 0 so blocked dependents are failed
            let available = self.budget.available(&pool).await.map_err(JobsError::Store)?;
            let outcome = self
                .store
                .claim_next(ClaimRequest::new(pool.as_str(), available, now))
                .instrument(crate::telemetry::job_claim_span(&pool))
                .await?;

            // claimed jobs are handed off before any archive write can fail
            for job in outcome.claimed {
                let token = match self.budget.try_acquire(&pool, job.id).await {
                    Ok(Some(token)) => token,
                    Ok(None) => {
                        tracing::warn!(job_id = %job.id, pool = %pool, "pool full after claim, returning job to queue");
                        self.give_back(job.id, "returned to queue: pool full").await;
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, pool = %pool, "budget error: {err}");
                        self.give_back(job.id, "returned to queue: budget unavailable").await;
                        continue;
                    }
                };

                let executor = self.executor.clone();
                let budget = self.budget.clone();
                let wake = self.wake.clone();
                self.inflight.lock().spawn(async move {
                    executor.run(job).await;
                    if let Err(err) = budget.release(token).await {
                        tracing::error!("budget release error: {err}");
                    }
                    wake.notify_one();
                });
                report.started += 1;
            }

            for failed in outcome.dependency_failed {
                let archived = match self.store.move_to_terminal(failed.id).await {
                    Ok(archived) => archived,
                    Err(err) => {
                        // the housekeeper archives it later
                        tracing::error!(job_id = %failed.id, "failed to archive dependency failure: {err}");
                        continue;
                    }
                };
                crate::telemetry::record_job_finished(
                    archived.pool(),
                    archived.handler_key().unwrap_or_default(),
                    "dependency_failed",
                    0,
                );
                self.stats
                    .record_finish(archived.pool(), archived.id, AttemptResult::Failed, 0);
                self.events.emit(
                    &archived,
                    JobEventPayload::DependencyFailed {
                        job_id: archived.id,
                        dependency: archived.depends_on.unwrap_or_default(),
                    },
                );
                report.dependency_failed += 1;
            }

            if let Ok((running, limit)) = self.budget.utilization(&pool).await {
                crate::telemetry::set_pool_utilization(&pool, running, limit);
            }
        }

        Ok(report)
    }

    /// Return a claimed job that never ran to the queue without spending
    /// an attempt.
    async fn give_back(&self, id: JobId, reason: &str) {
        let patch = JobPatch::new().refund_attempt().log(reason);
        if let Err(err) = self
            .store
            .transition(id, &[JobState::Started], JobState::Queued, patch)
            .await
        {
            tracing::error!(job_id = %id, "failed to return job to queue: {err}");
        }
    }

    fn reap(&self) {
        let mut inflight = self.inflight.lock();
        while let Some(joined) = inflight.try_join_next() {
            if let Err(err) = joined
                && err.is_panic()
            {
                tracing::error!("job task panicked: {err}");
            }
        }
    }

    /// Run passes until `shutdown` fires, then wait for running jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        let mut rx = self.events.subscribe_jobs();
        let mut delay = self.config.tick_interval;

        loop {
            match self.tick(Utc::now()).await {
                Ok(report) => {
                    if report.started > 0 || report.dependency_failed > 0 {
                        tracing::debug!(
                            started = report.started,
                            dependency_failed = report.dependency_failed,
                            "dispatch pass"
                        );
                    }
                    delay = self.config.tick_interval;
                }
                Err(err) => {
                    delay = (delay * 2).min(self.config.max_backoff);
                    tracing::warn!(backoff_ms = delay.as_millis() as u64, "dispatch pass failed: {err}");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = next_wake_event(&mut rx) => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.drain().await;
    }

    async fn drain(&self) {
        let mut inflight = std::mem::take(&mut *self.inflight.lock());
        if inflight.is_empty() {
            return;
        }
        tracing::info!(running = inflight.len(), "waiting for running jobs");
        let wait = async { while inflight.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, wait).await.is_err() {
            tracing::warn!("running jobs did not finish during shutdown, aborting");
            inflight.abort_all();
        }
    }
}

async fn next_wake_event(rx: &mut broadcast::Receiver<JobEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) if event.payload.wakes_dispatcher() => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("dispatcher lagged, skipped {skipped} events");
                return;
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
