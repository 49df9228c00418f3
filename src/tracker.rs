//! Execution Result Tracker: the only writer of execution status and logs.
//!
//! Status changes go through [`Store::transition_result`], so the
//! PENDING -> RUNNING -> {SUCCESS | FAILURE} machine is enforced in one
//! place. Log lines pass through the [`Redactor`] before they are stored.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ErrorKind, Result};
use crate::jobs::job::{LogRecord, LogSink};
use crate::redact::Redactor;
use crate::runtime::JobOutcome;
use crate::store::models::{ExecutionResult, ExecutionStatus, LogEntry, Severity};
use crate::store::Store;

#[derive(Clone)]
pub struct ExecutionTracker {
    store: Store,
    redactor: Arc<Redactor>,
    /// Literal values to scrub per execution (sensitive variable values).
    secrets: Arc<RwLock<HashMap<Uuid, Vec<String>>>>,
}

impl ExecutionTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            redactor: Arc::new(Redactor::new()),
            secrets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn register_secrets(&self, execution_id: Uuid, values: Vec<String>) {
        if !values.is_empty() {
            self.secrets.write().await.insert(execution_id, values);
        }
    }

    async fn redact(&self, execution_id: &Uuid, message: &str) -> String {
        let secrets = self.secrets.read().await;
        let literals = secrets.get(execution_id).map(Vec::as_slice).unwrap_or(&[]);
        self.redactor.redact(message, literals)
    }

    /// Append a log line to an execution. Logs stay writable after the
    /// execution is terminal (cleanup warnings land there).
    pub async fn log(&self, execution_id: Uuid, record: LogRecord) -> LogEntry {
        let message = self.redact(&execution_id, &record.message).await;
        tracing::debug!(
            execution_id = %execution_id,
            severity = %record.severity,
            message = %message,
            "Job log"
        );
        let entry = LogEntry {
            id: Uuid::new_v4(),
            execution_id,
            created_at: Utc::now(),
            severity: record.severity,
            message,
            object_ref: record.object_ref,
            grouping: record.grouping,
        };
        self.store.append_log(entry.clone()).await;
        entry
    }

    pub async fn log_message(
        &self,
        execution_id: Uuid,
        severity: Severity,
        message: impl Into<String>,
    ) -> LogEntry {
        self.log(execution_id, LogRecord::new(severity, message))
            .await
    }

    pub async fn mark_running(
        &self,
        execution_id: Uuid,
        handle: Option<&str>,
    ) -> Result<ExecutionResult> {
        let handle = handle.map(str::to_string);
        let result = self
            .store
            .transition_result(&execution_id, ExecutionStatus::Running, |r| {
                if handle.is_some() {
                    r.handle = handle;
                }
            })
            .await?;
        tracing::info!(execution_id = %execution_id, handle = ?result.handle, "Execution running");
        Ok(result)
    }

    pub async fn succeed(&self, execution_id: Uuid, payload: Value) -> Result<ExecutionResult> {
        let result = self
            .store
            .transition_result(&execution_id, ExecutionStatus::Success, |r| {
                r.result = Some(payload);
            })
            .await?;
        self.secrets.write().await.remove(&execution_id);
        tracing::info!(execution_id = %execution_id, class_path = %result.class_path, "Execution succeeded");
        Ok(result)
    }

    /// Move an execution to FAILURE and record why. The summary lands on the
    /// result row, the summary plus `detail` land in an error log line.
    pub async fn fail(
        &self,
        execution_id: Uuid,
        kind: ErrorKind,
        summary: impl Into<String>,
        detail: Option<String>,
    ) -> Result<ExecutionResult> {
        let summary = self.redact(&execution_id, &summary.into()).await;
        let stored_summary = summary.clone();
        let result = self
            .store
            .transition_result(&execution_id, ExecutionStatus::Failure, |r| {
                r.error_kind = Some(kind);
                r.error = Some(stored_summary);
            })
            .await?;

        let message = match detail {
            Some(detail) => format!("{}\n{}", summary, detail),
            None => summary,
        };
        self.log_message(execution_id, Severity::Error, message).await;
        self.secrets.write().await.remove(&execution_id);

        tracing::warn!(
            execution_id = %execution_id,
            class_path = %result.class_path,
            kind = %kind,
            error = ?result.error,
            "Execution failed"
        );
        Ok(result)
    }

    /// Record the outcome of the shared job runtime.
    pub async fn finish(&self, execution_id: Uuid, outcome: JobOutcome) -> Result<ExecutionResult> {
        match outcome {
            JobOutcome::Success(payload) => self.succeed(execution_id, payload).await,
            JobOutcome::Failed {
                kind,
                summary,
                detail,
            } => self.fail(execution_id, kind, summary, detail).await,
        }
    }

    /// A sink that writes a job's log lines into this execution.
    pub fn sink(&self, execution_id: Uuid) -> Arc<dyn LogSink> {
        Arc::new(TrackerSink {
            tracker: self.clone(),
            execution_id,
        })
    }
}

struct TrackerSink {
    tracker: ExecutionTracker,
    execution_id: Uuid,
}

#[async_trait]
impl LogSink for TrackerSink {
    async fn write(&self, record: LogRecord) {
        self.tracker.log(self.execution_id, record).await;
    }
}
