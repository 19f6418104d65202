use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::job::{BackgroundJob, JobId};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    /// Pool of the job the event is about.
    pub worker: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(worker: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: Uuid::now_v7(),
            idempotency_key: idempotency_key.into(),
            worker: worker.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    /// Build an event about `job`. The idempotency key combines the job's
    /// ref id, the event kind and the attempt number.
    pub fn for_job(job: &BackgroundJob, payload: JobEventPayload) -> Self {
        let key = format!("{}:{}:{}", job.ref_id, payload.kind(), job.attempts);
        Self {
            meta: EventMeta::new(job.pool(), key),
            payload,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.payload.job_id()
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was stored in the queue.
    Enqueued { job_id: JobId, handler: String },
    /// Job was claimed by the dispatcher and is starting.
    Claimed { job_id: JobId, attempt: u32 },
    /// Handler reported progress.
    Progress { job_id: JobId, progress: f64 },
    /// Job completed successfully.
    Completed { job_id: JobId, duration_ms: i64 },
    /// Job failed terminally.
    Failed { job_id: JobId, code: ErrorCode },
    /// Failed attempt put back on the queue.
    Retried {
        job_id: JobId,
        attempt: u32,
        run_after: DateTime<Utc>,
    },
    /// Job was cancelled.
    Cancelled { job_id: JobId },
    /// A cancel request arrived but the handler finished regardless.
    CancelIgnored { job_id: JobId },
    /// Job exceeded its timeout.
    TimedOut { job_id: JobId, timeout_secs: u64 },
    /// Archived failure manually put back on the queue.
    Requeued { job_id: JobId },
    /// Job can never run because its dependency did not complete.
    DependencyFailed { job_id: JobId, dependency: JobId },
    /// A scheduled task produced a job.
    TaskFired { task: String, job_id: JobId },
}

impl JobEventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEventPayload::Enqueued { .. } => "enqueued",
            JobEventPayload::Claimed { .. } => "claimed",
            JobEventPayload::Progress { .. } => "progress",
            JobEventPayload::Completed { .. } => "completed",
            JobEventPayload::Failed { .. } => "failed",
            JobEventPayload::Retried { .. } => "retried",
            JobEventPayload::Cancelled { .. } => "cancelled",
            JobEventPayload::CancelIgnored { .. } => "cancel_ignored",
            JobEventPayload::TimedOut { .. } => "timed_out",
            JobEventPayload::Requeued { .. } => "requeued",
            JobEventPayload::DependencyFailed { .. } => "dependency_failed",
            JobEventPayload::TaskFired { .. } => "task_fired",
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEventPayload::Enqueued { job_id, .. }
            | JobEventPayload::Claimed { job_id, .. }
            | JobEventPayload::Progress { job_id, .. }
            | JobEventPayload::Completed { job_id, .. }
            | JobEventPayload::Failed { job_id, .. }
            | JobEventPayload::Retried { job_id, .. }
            | JobEventPayload::Cancelled { job_id }
            | JobEventPayload::CancelIgnored { job_id }
            | JobEventPayload::TimedOut { job_id, .. }
            | JobEventPayload::Requeued { job_id }
            | JobEventPayload::DependencyFailed { job_id, .. }
            | JobEventPayload::TaskFired { job_id, .. } => Some(*job_id),
        }
    }

    /// Events after which the dispatcher may find new work.
    pub fn wakes_dispatcher(&self) -> bool {
        matches!(
            self,
            JobEventPayload::Enqueued { .. }
                | JobEventPayload::Retried { .. }
                | JobEventPayload::Requeued { .. }
                | JobEventPayload::Completed { .. }
                | JobEventPayload::TaskFired { .. }
        )
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Trait for subscribing to job lifecycle events.
pub trait JobEventStream: Send + Sync {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// `InProcEventBus` is a fan-out bus for job lifecycle events. Events are
/// broadcast to all active subscribers; a subscriber that falls behind gets
/// `RecvError::Lagged` but never blocks the publisher.
///
/// # Example
///
/// ```
/// use heron::{InProcEventBus, JobEventStream};
///
/// let bus = InProcEventBus::new(1000);
/// let _rx1 = bus.subscribe_jobs();
/// let _rx2 = bus.subscribe_jobs();
/// assert_eq!(bus.subscriber_count(), 2);
/// ```
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering at most `capacity` events.
    ///
    /// When the buffer is full, old events are dropped and subscribers
    /// will receive `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish a job event to all subscribers.
    ///
    /// This method is non-blocking. If no subscribers exist, the event
    /// is silently dropped.
    pub fn publish_job(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    /// Shorthand for publishing an event about `job`.
    pub fn emit(&self, job: &BackgroundJob, payload: JobEventPayload) {
        self.publish_job(JobEvent::for_job(job, payload));
    }

    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher<JobEvent> for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_job(event);
        Ok(())
    }
}

impl JobEventStream for InProcEventBus {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe_job_events()
    }
}
