use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::jobs::job::{JobArguments, JobMeta};
use crate::jobs::schema::InputSchema;
use crate::runtime::TimeLimits;
use crate::scheduler::recurrence::Recurrence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failure)
    }

    /// PENDING -> RUNNING -> {SUCCESS | FAILURE}, plus PENDING -> FAILURE when
    /// the job never started. Terminal states have no way out.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failure) | (Running, Success) | (Running, Failure)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "PENDING"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Success => write!(f, "SUCCESS"),
            ExecutionStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Debug => write!(f, "debug"),
            Severity::Info => write!(f, "info"),
            Severity::Success => write!(f, "success"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Operator-set values that survive registry refreshes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOverrides {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub approval_required: Option<bool>,
    #[serde(default)]
    pub default_queue: Option<String>,
    #[serde(default)]
    pub allowed_queues: Option<Vec<String>>,
    #[serde(default)]
    pub soft_time_limit_secs: Option<u64>,
    #[serde(default)]
    pub hard_time_limit_secs: Option<u64>,
}

/// Persisted view of a registered job, decoupled from its code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub class_path: String,
    pub source: String,
    pub meta: JobMeta,
    pub schema: InputSchema,
    pub overrides: JobOverrides,
    /// Set when the job disappeared from every source on the last refresh.
    pub missing: bool,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(class_path: String, source: String, meta: JobMeta, schema: InputSchema) -> Self {
        let now = Utc::now();
        Self {
            class_path,
            source,
            meta,
            schema,
            overrides: JobOverrides::default(),
            missing: false,
            created_at: now,
            refreshed_at: now,
        }
    }

    pub fn enabled(&self) -> bool {
        self.overrides.enabled.unwrap_or(self.meta.enabled)
    }

    pub fn approval_required(&self) -> bool {
        self.overrides
            .approval_required
            .unwrap_or(self.meta.approval_required)
    }

    pub fn default_queue<'a>(&'a self, global_default: &'a str) -> &'a str {
        self.overrides
            .default_queue
            .as_deref()
            .or(self.meta.default_queue.as_deref())
            .unwrap_or(global_default)
    }

    /// A job that names no queues may only run on its default queue.
    pub fn allows_queue(&self, queue: &str, global_default: &str) -> bool {
        let allowed = self
            .overrides
            .allowed_queues
            .as_ref()
            .unwrap_or(&self.meta.allowed_queues);
        if allowed.is_empty() {
            queue == self.default_queue(global_default)
        } else {
            allowed.iter().any(|q| q == queue) || queue == self.default_queue(global_default)
        }
    }

    pub fn time_limits(&self, defaults: TimeLimits) -> TimeLimits {
        let soft = self
            .overrides
            .soft_time_limit_secs
            .or(self.meta.soft_time_limit_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.soft);
        let hard = self
            .overrides
            .hard_time_limit_secs
            .or(self.meta.hard_time_limit_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.hard);
        TimeLimits { soft, hard }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    WorkerPool,
    OrchestratorPod,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::WorkerPool => write!(f, "worker-pool"),
            BackendKind::OrchestratorPod => write!(f, "orchestrator-pod"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueueBackend {
    WorkerPool { topic: String },
    OrchestratorPod { namespace: String, image: String },
}

/// Named routing target bound to one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionQueue {
    pub name: String,
    pub backend: QueueBackend,
}

impl ExecutionQueue {
    pub fn kind(&self) -> BackendKind {
        match self.backend {
            QueueBackend::WorkerPool { .. } => BackendKind::WorkerPool,
            QueueBackend::OrchestratorPod { .. } => BackendKind::OrchestratorPod,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    NoneRequired,
    PendingApproval,
    Approved,
    Denied,
}

impl ApprovalState {
    /// Whether the Beat (or an approval) may dispatch the request.
    pub fn allows_dispatch(self) -> bool {
        matches!(self, ApprovalState::NoneRequired | ApprovalState::Approved)
    }
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalState::NoneRequired => write!(f, "NONE_REQUIRED"),
            ApprovalState::PendingApproval => write!(f, "PENDING_APPROVAL"),
            ApprovalState::Approved => write!(f, "APPROVED"),
            ApprovalState::Denied => write!(f, "DENIED"),
        }
    }
}

/// Stored intent to run a job, possibly recurring, possibly gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub name: String,
    pub class_path: String,
    pub principal: String,
    pub arguments: JobArguments,
    pub queue: String,
    pub recurrence: Recurrence,
    pub start_time: DateTime<Utc>,
    pub time_zone: String,
    pub approval: ApprovalState,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub dryrun: bool,
    pub enabled: bool,
    /// One-shot requests are consumed once dispatched.
    pub fired: bool,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub total_run_count: u64,
    pub created_at: DateTime<Utc>,
    /// Bumped on every row update; used for conditional writes.
    pub version: u64,
}

impl ExecutionRequest {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.fired
            && self.approval.allows_dispatch()
            && self.next_due_at.map(|due| due <= now).unwrap_or(false)
    }
}

/// One execution attempt and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub class_path: String,
    pub job_name: String,
    pub queue: String,
    pub backend: BackendKind,
    pub request_id: Option<Uuid>,
    pub principal: String,
    pub status: ExecutionStatus,
    /// Worker slot name or pod name, once the backend has one.
    pub handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub version: u64,
}

impl ExecutionResult {
    pub fn new(
        class_path: &str,
        job_name: &str,
        queue: &ExecutionQueue,
        request_id: Option<Uuid>,
        principal: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            class_path: class_path.to_string(),
            job_name: job_name.to_string(),
            queue: queue.name.clone(),
            backend: queue.kind(),
            request_id,
            principal: principal.to_string(),
            status: ExecutionStatus::Pending,
            handle: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error_kind: None,
            error: None,
            cancel_requested: false,
            version: 0,
        }
    }
}

/// Append-only log line attached to an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub object_ref: Option<String>,
    pub grouping: Option<String>,
}
