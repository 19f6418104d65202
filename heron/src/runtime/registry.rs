use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{JobsError, JobsResult};
use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{BackgroundJob, JobId};
use crate::store::{JobPatch, JobStore};

use super::cancel::CancelToken;

/// Code that runs a job.
///
/// Returning `Err` fails the attempt; the retry policy decides what happens
/// next. Return a [`JobsError`] to control the recorded error code.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<Option<serde_json::Value>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<serde_json::Value>>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        (self.0)(ctx, payload).await
    }
}

/// Handlers keyed by command name or API request type.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<serde_json::Value>>> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    pub fn with(mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Handle passed to a running handler: the job record, progress reporting
/// and cooperative cancellation.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<BackgroundJob>,
    parent: Option<Arc<BackgroundJob>>,
    store: Option<Arc<dyn JobStore>>,
    events: Option<Arc<InProcEventBus>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub(crate) fn new(
        job: Arc<BackgroundJob>,
        parent: Option<Arc<BackgroundJob>>,
        store: Arc<dyn JobStore>,
        events: Arc<InProcEventBus>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            job,
            parent,
            store: Some(store),
            events: Some(events),
            cancel,
        }
    }

    /// A context not backed by a store; progress and logs are dropped.
    pub fn detached(job: BackgroundJob) -> Self {
        Self {
            job: Arc::new(job),
            parent: None,
            store: None,
            events: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn job(&self) -> &BackgroundJob {
        &self.job
    }

    /// The job this one depends on, when that dependency completed.
    pub fn parent(&self) -> Option<&BackgroundJob> {
        self.parent.as_deref()
    }

    /// Deserialize the request body.
    pub fn payload<T: DeserializeOwned>(&self) -> JobsResult<T> {
        Ok(serde_json::from_value(self.job.request_body.clone())?)
    }

    /// Record progress (0..=1), an optional status and an optional log line.
    pub async fn report(
        &self,
        progress: Option<f64>,
        status: Option<&str>,
        log: Option<&str>,
    ) -> JobsResult<()> {
        let mut patch = JobPatch::new();
        patch.progress = progress;
        patch.status = status.map(str::to_string);
        patch.append_log = log.map(str::to_string);
        if patch.is_empty() {
            return Ok(());
        }
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.update(self.job.id, patch).await?;
        if let (Some(progress), Some(events)) = (progress, &self.events) {
            events.emit(
                &self.job,
                JobEventPayload::Progress {
                    job_id: self.job.id,
                    progress,
                },
            );
        }
        Ok(())
    }

    pub async fn log(&self, line: &str) -> JobsResult<()> {
        self.report(None, None, Some(line)).await
    }

    pub async fn progress(&self, progress: f64) -> JobsResult<()> {
        self.report(Some(progress), None, None).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation of this job is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(Cancelled)` once cancellation was requested; handlers can `?` it
    /// between steps.
    pub fn check_cancelled(&self) -> JobsResult<()> {
        if self.is_cancelled() {
            return Err(JobsError::Cancelled(self.job.id));
        }
        Ok(())
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::persistence::InMemoryJobStore;
    use serde::Deserialize;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn execute(
            &self,
            _ctx: JobContext,
            payload: serde_json::Value,
        ) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(Some(payload))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_name() {
        let mut registry = CommandRegistry::new().with("Echo", Echo);
        registry.register_fn("Double", |_ctx, payload| async move {
            let n = payload["n"].as_i64().unwrap_or_default();
            Ok(Some(json!(n * 2)))
        });

        assert_eq!(registry.names(), vec!["Double", "Echo"]);
        assert!(registry.get("Missing").is_none());

        let ctx = JobContext::detached(BackgroundJob::command("Double", json!({"n": 21})));
        let handler = registry.get("Double").unwrap();
        let out = handler.execute(ctx, json!({"n": 21})).await.unwrap();
        assert_eq!(out, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_report_updates_live_job() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store
            .enqueue(BackgroundJob::command("Echo", json!({})))
            .await
            .unwrap();
        let ctx = JobContext::new(
            Arc::new(job.clone()),
            None,
            store.clone(),
            Arc::new(InProcEventBus::default()),
            CancelToken::new(),
        );

        ctx.report(Some(0.5), None, Some("halfway")).await.unwrap();
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.5);
        assert_eq!(stored.status.as_deref(), Some("halfway"));
        assert_eq!(stored.logs, "halfway\n");
        assert_eq!(stored.state, JobState::Queued);
    }

    #[test]
    fn test_check_cancelled_and_payload() {
        #[derive(Deserialize)]
        struct Body {
            to: String,
        }

        let ctx = JobContext::detached(BackgroundJob::command("Mail", json!({"to": "x@y"})));
        assert_eq!(ctx.payload::<Body>().unwrap().to, "x@y");
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(JobsError::Cancelled(_))));
    }
}
