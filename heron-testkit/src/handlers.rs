use async_trait::async_trait;
use heron::{CommandHandler, JobContext, JobId, JobsError};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Returns the request body as the response.
#[derive(Clone, Debug, Default)]
pub struct EchoCommand;

#[async_trait]
impl CommandHandler for EchoCommand {
    async fn execute(&self, _ctx: JobContext, payload: Value) -> anyhow::Result<Option<Value>> {
        Ok(Some(payload))
    }
}

/// Fails every attempt and counts how often it ran.
#[derive(Clone, Debug, Default)]
pub struct AlwaysFailCommand {
    calls: Arc<AtomicUsize>,
}

impl AlwaysFailCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for AlwaysFailCommand {
    async fn execute(&self, ctx: JobContext, _payload: Value) -> anyhow::Result<Option<Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::bail!("attempt {} of job {} failed (call {call})", ctx.job().attempts, ctx.id())
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Clone, Debug)]
pub struct FlakyCommand {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyCommand {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for FlakyCommand {
    async fn execute(&self, _ctx: JobContext, payload: Value) -> anyhow::Result<Option<Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("transient failure {}", call + 1);
        }
        Ok(Some(payload))
    }
}

#[derive(Debug, Deserialize)]
struct SleepRequest {
    #[serde(default)]
    ms: u64,
}

/// Sleeps for `{"ms": n}` milliseconds and ignores cancel requests.
#[derive(Clone, Debug, Default)]
pub struct SleepCommand;

#[async_trait]
impl CommandHandler for SleepCommand {
    async fn execute(&self, ctx: JobContext, _payload: Value) -> anyhow::Result<Option<Value>> {
        let request: SleepRequest = ctx.payload()?;
        tokio::time::sleep(Duration::from_millis(request.ms)).await;
        Ok(Some(serde_json::json!({ "slept_ms": request.ms })))
    }
}

/// Waits up to `{"ms": n}` milliseconds, stopping early with
/// [`JobsError::Cancelled`] when cancellation is requested.
#[derive(Clone, Debug, Default)]
pub struct CooperativeCommand;

#[async_trait]
impl CommandHandler for CooperativeCommand {
    async fn execute(&self, ctx: JobContext, _payload: Value) -> anyhow::Result<Option<Value>> {
        let request: SleepRequest = ctx.payload()?;
        ctx.log("waiting").await?;
        tokio::select! {
            _ = ctx.cancelled() => Err(JobsError::Cancelled(ctx.id()).into()),
            _ = tokio::time::sleep(Duration::from_millis(request.ms)) => {
                ctx.progress(1.0).await?;
                Ok(None)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub job_id: JobId,
    pub attempt: u32,
    pub payload: Value,
    pub parent: Option<JobId>,
}

/// Records every call and succeeds.
#[derive(Clone, Debug, Default)]
pub struct RecordingCommand {
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl RecordingCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(actual, expected, "Expected {expected} calls, got {actual}");
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl CommandHandler for RecordingCommand {
    async fn execute(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Option<Value>> {
        tracing::debug!(job_id = %ctx.id(), "recording call");
        self.calls.lock().push(CallRecord {
            job_id: ctx.id(),
            attempt: ctx.job().attempts,
            payload,
            parent: ctx.parent().map(|parent| parent.id),
        });
        Ok(None)
    }
}
