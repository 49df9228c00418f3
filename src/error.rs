use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum JobplaneError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid arguments: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job is not enabled: {0}")]
    JobDisabled(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Backend unavailable: {0}")]
    Dispatch(String),

    #[error("Failed to load job {class_path}: {reason}")]
    Load { class_path: String, reason: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobplaneError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }
}

pub type Result<T> = std::result::Result<T, JobplaneError>;

/// Why an execution ended in `FAILURE`. Persisted on the result row so that
/// a backend outage can be told apart from a job that raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Hand-off to the backend failed; the job never started.
    Dispatch,
    /// Job code returned an error, panicked, or the remote process crashed.
    Runtime,
    /// Hard time limit exceeded.
    TimeLimit,
    Cancelled,
    /// Contact with the backend was lost while the job was in flight.
    BackendLost,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Dispatch => write!(f, "dispatch"),
            ErrorKind::Runtime => write!(f, "runtime"),
            ErrorKind::TimeLimit => write!(f, "time_limit"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::BackendLost => write!(f, "backend_lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = JobplaneError::Validation(vec![
            FieldError::new("count", "must be >= 1"),
            FieldError::new("name", "is required"),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid arguments: count: must be >= 1; name: is required"
        );
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TimeLimit).unwrap();
        assert_eq!(json, "\"time_limit\"");
        assert_eq!(ErrorKind::BackendLost.to_string(), "backend_lost");
    }
}
