use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, JobsError};

/// Name of the pool used by jobs that don't name a worker.
pub const DEFAULT_POOL: &str = "default";

/// Retry limit applied when neither the job nor the runtime config sets one.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;

/// Store-assigned job identifier. Monotonically increasing.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Queued -> Started -> Executed -> Completed
///    |         |          |
///    |         +----------+-----> Failed -> Queued (retry / requeue)
///    +---------+------------------------> Cancelled
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Started,
    Executed,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Started => "Started",
            JobState::Executed => "Executed",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        }
    }

    /// Completed, Failed and Cancelled are terminal. A Failed job may still be
    /// put back on the queue by the retry policy or a manual requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Started)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Started, Executed)
                | (Started, Completed)
                | (Started, Failed)
                | (Started, Cancelled)
                | (Started, Queued)
                | (Executed, Completed)
                | (Executed, Failed)
                | (Failed, Queued)
                | (Failed, Cancelled)
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Queued" => JobState::Queued,
            "Started" => JobState::Started,
            "Executed" => JobState::Executed,
            "Completed" => JobState::Completed,
            "Failed" => JobState::Failed,
            "Cancelled" => JobState::Cancelled,
            other => {
                return Err(JobsError::Validation(format!(
                    "unknown job state '{other}'"
                )));
            }
        })
    }
}

/// Which table a job record currently lives in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobLocation {
    #[default]
    Live,
    Completed,
    Failed,
}

/// Whether the job targets a named command or a request type handled by an API.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    #[default]
    Command,
    Api,
}

/// Calendar month used to partition archived jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(date: DateTime<Utc>) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl Display for MonthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || JobsError::Validation(format!("invalid month '{s}', expected YYYY-MM"));
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(Self { year, month })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field_name: String,
    pub error_code: String,
    pub message: String,
}

/// Error recorded on a failed or cancelled job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl JobError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            stack_trace: None,
            errors: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    /// Build the job-level error for a handler failure. Typed errors keep
    /// their code; anything else becomes `ExecutionFailed` with the full
    /// context chain as the trace.
    pub fn from_handler(err: &anyhow::Error) -> Self {
        if let Some(typed) = JobsError::from_handler_error(err) {
            return Self::new(typed.code(), typed.to_string());
        }
        let mut error = Self::new(ErrorCode::ExecutionFailed, err.to_string());
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        if !chain.is_empty() {
            error.stack_trace = Some(chain.join("\n"));
        }
        error
    }
}

impl From<&JobsError> for JobError {
    fn from(value: &JobsError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

/// Optional overrides supplied at enqueue time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub ref_id: Option<String>,
    pub parent_id: Option<JobId>,
    pub worker: Option<String>,
    pub run_after: Option<DateTime<Utc>>,
    pub callback: Option<String>,
    pub depends_on: Option<JobId>,
    pub user_id: Option<String>,
    pub retry_limit: Option<u32>,
    pub reply_to: Option<String>,
    pub tag: Option<String>,
    pub batch_id: Option<String>,
    pub created_by: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(with = "optional_duration_secs")]
    pub timeout: Option<std::time::Duration>,
    pub args: BTreeMap<String, String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    pub fn with_depends_on(mut self, id: JobId) -> Self {
        self.depends_on = Some(id);
        self
    }

    pub fn with_run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Effective timeout; `timeout_secs` wins over `timeout`.
    pub fn effective_timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
            .or_else(|| self.timeout.map(|t| t.as_secs().max(1)))
    }
}

pub(crate) mod optional_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// A background job record.
///
/// The same record is used for live, completed and failed jobs;
/// [`JobLocation`] tells which store currently owns it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: JobId,
    pub parent_id: Option<JobId>,
    pub ref_id: String,
    pub worker: Option<String>,
    pub tag: Option<String>,
    pub batch_id: Option<String>,
    pub callback: Option<String>,
    pub depends_on: Option<JobId>,
    pub run_after: Option<DateTime<Utc>>,
    pub created_date: DateTime<Utc>,
    pub created_by: Option<String>,
    pub request_type: RequestKind,
    pub command: Option<String>,
    pub request: Option<String>,
    pub request_body: serde_json::Value,
    pub user_id: Option<String>,
    pub response: Option<String>,
    pub response_body: Option<serde_json::Value>,
    pub state: JobState,
    pub started_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub notified_date: Option<DateTime<Utc>>,
    pub retry_limit: u32,
    pub attempts: u32,
    pub duration_ms: i64,
    pub timeout_secs: Option<u64>,
    pub progress: f64,
    pub status: Option<String>,
    pub logs: String,
    pub last_activity_date: DateTime<Utc>,
    pub reply_to: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error: Option<JobError>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub location: JobLocation,
}

impl BackgroundJob {
    fn blank(request_type: RequestKind, body: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::default(),
            parent_id: None,
            ref_id: Uuid::new_v4().simple().to_string(),
            worker: None,
            tag: None,
            batch_id: None,
            callback: None,
            depends_on: None,
            run_after: None,
            created_date: now,
            created_by: None,
            request_type,
            command: None,
            request: None,
            request_body: body,
            user_id: None,
            response: None,
            response_body: None,
            state: JobState::Queued,
            started_date: None,
            completed_date: None,
            notified_date: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            attempts: 0,
            duration_ms: 0,
            timeout_secs: None,
            progress: 0.0,
            status: None,
            logs: String::new(),
            last_activity_date: now,
            reply_to: None,
            error_code: None,
            error: None,
            args: BTreeMap::new(),
            meta: BTreeMap::new(),
            location: JobLocation::Live,
        }
    }

    /// A job executed by the command registered under `command`.
    pub fn command(command: impl Into<String>, body: serde_json::Value) -> Self {
        let mut job = Self::blank(RequestKind::Command, body);
        job.command = Some(command.into());
        job
    }

    /// A job executed by the handler for the request type `request`.
    pub fn api(request: impl Into<String>, body: serde_json::Value) -> Self {
        let mut job = Self::blank(RequestKind::Api, body);
        job.request = Some(request.into());
        job
    }

    pub fn with_options(mut self, options: &JobOptions) -> Self {
        if let Some(ref_id) = &options.ref_id {
            self.ref_id = ref_id.clone();
        }
        self.parent_id = options.parent_id.or(self.parent_id);
        self.worker = options.worker.clone().or(self.worker);
        self.run_after = options.run_after.or(self.run_after);
        self.callback = options.callback.clone().or(self.callback);
        self.depends_on = options.depends_on.or(self.depends_on);
        self.user_id = options.user_id.clone().or(self.user_id);
        if let Some(limit) = options.retry_limit {
            self.retry_limit = limit;
        }
        self.reply_to = options.reply_to.clone().or(self.reply_to);
        self.tag = options.tag.clone().or(self.tag);
        self.batch_id = options.batch_id.clone().or(self.batch_id);
        self.created_by = options.created_by.clone().or(self.created_by);
        self.timeout_secs = options.effective_timeout_secs().or(self.timeout_secs);
        self.args.extend(options.args.clone());
        self
    }

    /// Name the registry resolves the handler by.
    pub fn handler_key(&self) -> Option<&str> {
        match self.request_type {
            RequestKind::Command => self.command.as_deref(),
            RequestKind::Api => self.request.as_deref(),
        }
    }

    /// Pool this job runs in.
    pub fn pool(&self) -> &str {
        self.worker.as_deref().unwrap_or(DEFAULT_POOL)
    }

    /// Jobs dispatch by `run_after` (falling back to `created_date`), then id.
    pub fn dispatch_key(&self) -> (DateTime<Utc>, JobId) {
        (self.run_after.unwrap_or(self.created_date), self.id)
    }

    pub fn month(&self) -> MonthKey {
        MonthKey::of(self.created_date)
    }

    /// Checks the payload fields needed before a job may be stored.
    pub fn validate(&self) -> Result<(), JobsError> {
        match self.request_type {
            RequestKind::Command if self.command.as_deref().is_none_or(str::is_empty) => Err(
                JobsError::Validation("command jobs require a command name".into()),
            ),
            RequestKind::Api if self.request.as_deref().is_none_or(str::is_empty) => Err(
                JobsError::Validation("api jobs require a request type".into()),
            ),
            _ if self.attempts > self.retry_limit + 1 => Err(JobsError::Validation(format!(
                "attempts {} exceed retry limit {}",
                self.attempts, self.retry_limit
            ))),
            _ => Ok(()),
        }
    }

    /// Log lines from `log_start` (a byte offset) onwards.
    pub fn logs_from(&self, log_start: usize) -> &str {
        if log_start >= self.logs.len() {
            return "";
        }
        let mut start = log_start;
        while !self.logs.is_char_boundary(start) {
            start += 1;
        }
        &self.logs[start..]
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary::from(self)
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id,
            ref_id: self.ref_id.clone(),
        }
    }
}

/// Identifiers handed back to callers after enqueue.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub id: JobId,
    pub ref_id: String,
}

/// Denormalized view of a job, kept for live and archived jobs alike.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub parent_id: Option<JobId>,
    pub ref_id: String,
    pub worker: Option<String>,
    pub tag: Option<String>,
    pub batch_id: Option<String>,
    pub created_date: DateTime<Utc>,
    pub created_by: Option<String>,
    pub request_type: RequestKind,
    pub command: Option<String>,
    pub request: Option<String>,
    pub response: Option<String>,
    pub user_id: Option<String>,
    pub callback: Option<String>,
    pub started_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub state: JobState,
    pub duration_ms: i64,
    pub attempts: u32,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl From<&BackgroundJob> for JobSummary {
    fn from(job: &BackgroundJob) -> Self {
        Self {
            id: job.id,
            parent_id: job.parent_id,
            ref_id: job.ref_id.clone(),
            worker: job.worker.clone(),
            tag: job.tag.clone(),
            batch_id: job.batch_id.clone(),
            created_date: job.created_date,
            created_by: job.created_by.clone(),
            request_type: job.request_type,
            command: job.command.clone(),
            request: job.request.clone(),
            response: job.response.clone(),
            user_id: job.user_id.clone(),
            callback: job.callback.clone(),
            started_date: job.started_date,
            completed_date: job.completed_date,
            state: job.state,
            duration_ms: job.duration_ms,
            attempts: job.attempts,
            error_code: job.error_code,
            error_message: job.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Incremental progress view returned to pollers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub id: JobId,
    pub state: JobState,
    pub progress: f64,
    pub status: Option<String>,
    pub logs: String,
    pub duration_ms: i64,
    pub error: Option<JobError>,
}

/// Per-id outcome of a bulk operation such as cancel or requeue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<JobId>,
    pub errors: BTreeMap<JobId, String>,
}

impl BatchResult {
    pub fn ok(&mut self, id: JobId) {
        self.results.push(id);
    }

    pub fn err(&mut self, id: JobId, error: impl Display) {
        self.errors.insert(id, error.to_string());
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Started));
        assert!(JobState::Started.can_transition_to(JobState::Executed));
        assert!(JobState::Executed.can_transition_to(JobState::Completed));
        assert!(JobState::Failed.can_transition_to(JobState::Queued));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));

        assert!(!JobState::Completed.can_transition_to(JobState::Queued));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Queued));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Executed.can_transition_to(JobState::Cancelled));
    }

    #[test]
    fn test_options_override_defaults() {
        let options = JobOptions::new()
            .with_worker("mail")
            .with_retry_limit(5)
            .with_ref_id("ref-1")
            .with_arg("k", "v");
        let job = BackgroundJob::command("SendEmail", json!({"to": "a@b"})).with_options(&options);

        assert_eq!(job.worker.as_deref(), Some("mail"));
        assert_eq!(job.pool(), "mail");
        assert_eq!(job.retry_limit, 5);
        assert_eq!(job.ref_id, "ref-1");
        assert_eq!(job.args.get("k").map(String::as_str), Some("v"));
        assert_eq!(job.handler_key(), Some("SendEmail"));
    }

    #[test]
    fn test_default_ref_id_is_generated() {
        let a = BackgroundJob::command("A", json!(null));
        let b = BackgroundJob::command("A", json!(null));
        assert_eq!(a.ref_id.len(), 32);
        assert_ne!(a.ref_id, b.ref_id);
        assert_eq!(a.pool(), DEFAULT_POOL);
    }

    #[test]
    fn test_timeout_secs_wins_over_duration() {
        let mut options = JobOptions::new();
        options.timeout = Some(std::time::Duration::from_secs(30));
        assert_eq!(options.effective_timeout_secs(), Some(30));
        options.timeout_secs = Some(5);
        assert_eq!(options.effective_timeout_secs(), Some(5));
    }

    #[test]
    fn test_options_reject_invalid_timeout() {
        for body in [r#"{"timeout": -1.0}"#, r#"{"timeout": 1e300}"#] {
            let err = serde_json::from_str::<JobOptions>(body).unwrap_err();
            assert!(err.is_data(), "{body}: {err}");
        }

        let options: JobOptions = serde_json::from_str(r#"{"timeout": 2.5}"#).unwrap();
        assert_eq!(options.timeout, Some(std::time::Duration::from_millis(2500)));
        let options: JobOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.timeout, None);
    }

    #[test]
    fn test_validation_requires_handler_name() {
        let job = BackgroundJob::command("", json!({}));
        assert!(matches!(job.validate(), Err(JobsError::Validation(_))));

        let mut api = BackgroundJob::api("Req", json!({}));
        assert!(api.validate().is_ok());
        api.request = None;
        assert!(api.validate().is_err());
    }

    #[test]
    fn test_month_key_parse_and_display() {
        let key: MonthKey = "2026-03".parse().unwrap();
        assert_eq!(key, MonthKey::new(2026, 3));
        assert_eq!(key.to_string(), "2026-03");
        assert!("2026-13".parse::<MonthKey>().is_err());
        assert!("202603".parse::<MonthKey>().is_err());
    }

    #[test]
    fn test_logs_from_offset() {
        let mut job = BackgroundJob::command("A", json!(null));
        job.logs = "one\ntwo\n".into();
        assert_eq!(job.logs_from(0), "one\ntwo\n");
        assert_eq!(job.logs_from(4), "two\n");
        assert_eq!(job.logs_from(100), "");
    }

    #[test]
    fn test_handler_error_keeps_typed_code() {
        let err: anyhow::Error = JobsError::Cancelled(JobId(1)).into();
        assert_eq!(JobError::from_handler(&err).error_code, ErrorCode::Cancelled);

        let err = anyhow::anyhow!("disk full").context("writing report");
        let job_err = JobError::from_handler(&err);
        assert_eq!(job_err.error_code, ErrorCode::ExecutionFailed);
        assert_eq!(job_err.message, "writing report");
        assert_eq!(job_err.stack_trace.as_deref(), Some("disk full"));
    }
}
