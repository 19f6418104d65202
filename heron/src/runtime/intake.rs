use std::sync::Arc;

use tracing::Instrument;

use crate::error::JobsResult;
use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{BackgroundJob, JobOptions};
use crate::store::JobStore;

/// Single entry point that puts new jobs on the queue.
///
/// Applies enqueue options and runtime defaults, stores the job and
/// announces it so the dispatcher wakes up.
pub struct JobIntake {
    store: Arc<dyn JobStore>,
    events: Arc<InProcEventBus>,
    default_retry_limit: u32,
}

impl std::fmt::Debug for JobIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobIntake")
            .field("default_retry_limit", &self.default_retry_limit)
            .finish_non_exhaustive()
    }
}

impl JobIntake {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: Arc<InProcEventBus>,
        default_retry_limit: u32,
    ) -> Self {
        Self {
            store,
            events,
            default_retry_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<InProcEventBus> {
        &self.events
    }

    pub async fn submit(
        &self,
        job: BackgroundJob,
        options: &JobOptions,
    ) -> JobsResult<BackgroundJob> {
        let mut job = job.with_options(options);
        if options.retry_limit.is_none() {
            job.retry_limit = self.default_retry_limit;
        }

        let handler = job.handler_key().unwrap_or_default().to_string();
        let span = crate::telemetry::job_enqueue_span(job.pool(), &handler);
        let job = self.store.enqueue(job).instrument(span).await?;

        crate::telemetry::record_job_enqueued(job.pool(), &handler);
        self.events.emit(
            &job,
            JobEventPayload::Enqueued {
                job_id: job.id,
                handler,
            },
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobsError;
    use crate::events::JobEventStream;
    use crate::job::JobState;
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    fn intake() -> JobIntake {
        JobIntake::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InProcEventBus::default()),
            4,
        )
    }

    #[tokio::test]
    async fn test_submit_applies_runtime_default_retry_limit() {
        let intake = intake();
        let job = intake
            .submit(BackgroundJob::command("Echo", json!({})), &JobOptions::new())
            .await
            .unwrap();
        assert_eq!(job.retry_limit, 4);
        assert_eq!(job.state, JobState::Queued);

        let job = intake
            .submit(
                BackgroundJob::command("Echo", json!({})),
                &JobOptions::new().with_retry_limit(0),
            )
            .await
            .unwrap();
        assert_eq!(job.retry_limit, 0);
    }

    #[tokio::test]
    async fn test_submit_publishes_enqueued() {
        let intake = intake();
        let mut rx = intake.events().subscribe_jobs();
        let job = intake
            .submit(BackgroundJob::command("Echo", json!({})), &JobOptions::new())
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), Some(job.id));
        assert!(event.payload.wakes_dispatcher());
    }

    #[tokio::test]
    async fn test_invalid_job_is_rejected() {
        let intake = intake();
        let result = intake
            .submit(BackgroundJob::command("", json!({})), &JobOptions::new())
            .await;
        assert!(matches!(result, Err(JobsError::Validation(_))));
    }
}
