use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::schema::InputSchema;
use crate::store::models::Severity;

/// Decoded job input, keyed by variable name.
pub type JobArguments = serde_json::Map<String, Value>;

/// Metadata a job declares about itself. Operators can override some of it
/// per deployment through `JobOverrides`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub name: String,
    pub grouping: String,
    pub description: String,
    pub enabled: bool,
    pub approval_required: bool,
    pub supports_dryrun: bool,
    pub dryrun_default: bool,
    pub has_sensitive_variables: bool,
    /// Singleton jobs never have two non-terminal executions at once.
    pub is_singleton: bool,
    pub soft_time_limit_secs: Option<u64>,
    pub hard_time_limit_secs: Option<u64>,
    pub allowed_queues: Vec<String>,
    pub default_queue: Option<String>,
}

impl JobMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grouping: String::new(),
            description: String::new(),
            enabled: true,
            approval_required: false,
            supports_dryrun: false,
            dryrun_default: false,
            has_sensitive_variables: false,
            is_singleton: true,
            soft_time_limit_secs: None,
            hard_time_limit_secs: None,
            allowed_queues: Vec::new(),
            default_queue: None,
        }
    }

    pub fn with_grouping(mut self, grouping: impl Into<String>) -> Self {
        self.grouping = grouping.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_approval_required(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_dryrun(mut self, default: bool) -> Self {
        self.supports_dryrun = true;
        self.dryrun_default = default;
        self
    }

    pub fn with_sensitive_variables(mut self) -> Self {
        self.has_sensitive_variables = true;
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.is_singleton = false;
        self
    }

    pub fn with_time_limits(mut self, soft_secs: u64, hard_secs: u64) -> Self {
        self.soft_time_limit_secs = Some(soft_secs);
        self.hard_time_limit_secs = Some(hard_secs);
        self
    }

    pub fn with_queues(mut self, default: &str, allowed: &[&str]) -> Self {
        self.default_queue = Some(default.to_string());
        self.allowed_queues = allowed.iter().map(|q| q.to_string()).collect();
        self
    }
}

/// Error returned by a job's entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub detail: Option<String>,
    pub cancelled: bool,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            cancelled: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn cancelled() -> Self {
        Self {
            message: "Job was cancelled".to_string(),
            detail: None,
            cancelled: true,
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl<E> From<E> for JobFailure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        JobFailure::new(err.to_string()).with_detail(format!("{:?}", err))
    }
}

/// One log line emitted by a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<String>,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            grouping: None,
            object_ref: None,
        }
    }
}

/// Destination for job log lines. The worker pool writes straight into the
/// tracker; the in-pod runner writes JSON lines to stdout.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, record: LogRecord);
}

/// Handle passed to a running job.
#[derive(Clone)]
pub struct JobContext {
    pub execution_id: Uuid,
    pub class_path: String,
    pub dryrun: bool,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
    soft_limit: CancellationToken,
}

impl JobContext {
    pub fn new(
        execution_id: Uuid,
        class_path: impl Into<String>,
        dryrun: bool,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            class_path: class_path.into(),
            dryrun,
            sink,
            cancel,
            soft_limit: CancellationToken::new(),
        }
    }

    pub async fn log(&self, record: LogRecord) {
        self.sink.write(record).await;
    }

    pub async fn log_debug(&self, message: impl Into<String>) {
        self.log(LogRecord::new(Severity::Debug, message)).await;
    }

    pub async fn log_info(&self, message: impl Into<String>) {
        self.log(LogRecord::new(Severity::Info, message)).await;
    }

    pub async fn log_success(&self, message: impl Into<String>) {
        self.log(LogRecord::new(Severity::Success, message)).await;
    }

    pub async fn log_warning(&self, message: impl Into<String>) {
        self.log(LogRecord::new(Severity::Warning, message)).await;
    }

    pub async fn log_error(&self, message: impl Into<String>) {
        self.log(LogRecord::new(Severity::Error, message)).await;
    }

    /// True once the execution has been revoked.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative cancellation point for use between coarse-grained steps.
    pub fn checkpoint(&self) -> Result<(), JobFailure> {
        if self.cancel.is_cancelled() {
            Err(JobFailure::cancelled())
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// True once the soft time limit has elapsed. Jobs may use this to wrap up early.
    pub fn soft_limit_reached(&self) -> bool {
        self.soft_limit.is_cancelled()
    }

    pub async fn soft_limit_exceeded(&self) {
        self.soft_limit.cancelled().await
    }

    pub(crate) fn soft_limit_token(&self) -> CancellationToken {
        self.soft_limit.clone()
    }
}

/// A unit of user-defined work. Implementations are registered with the
/// registry under a stable class path and instantiated once per execution.
#[async_trait]
pub trait Job: Send + Sync {
    fn meta(&self) -> JobMeta;

    fn input_schema(&self) -> InputSchema {
        InputSchema::default()
    }

    async fn run(&self, ctx: &JobContext, args: JobArguments) -> Result<Value, JobFailure>;
}
