//! Entry point inside an execution pod (`jobplane pod-run`).
//!
//! The pod has no direct line to the tracker: it writes one JSON object per
//! line on stdout, and the pod executor turns the captured output into log
//! entries and the final status once the pod has finished.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorKind, JobplaneError, Result};
use crate::jobs::job::{JobArguments, JobContext, LogRecord, LogSink};
use crate::jobs::registry::JobRegistry;
use crate::jobs::schema::DRYRUN_VAR;
use crate::pod::manifest::{
    ENV_API_URL, ENV_ARGUMENTS, ENV_BROKER_URL, ENV_CLASS_PATH, ENV_EXECUTION_ID, ENV_HARD_LIMIT,
    ENV_SOFT_LIMIT,
};
use crate::runtime::{run_job, JobOutcome, TimeLimits};

/// One line of pod output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PodLine {
    Log(LogRecord),
    Result {
        payload: Value,
    },
    Error {
        kind: ErrorKind,
        summary: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

impl PodLine {
    pub fn from_outcome(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Success(payload) => PodLine::Result { payload },
            JobOutcome::Failed {
                kind,
                summary,
                detail,
            } => PodLine::Error {
                kind,
                summary,
                detail,
            },
        }
    }

    /// `None` for lines that are not ours (e.g. stray stderr output).
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// What the control plane passed to the pod through its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct PodEnvironment {
    pub execution_id: Uuid,
    pub class_path: String,
    pub arguments: JobArguments,
    pub limits: TimeLimits,
    pub api_url: Option<String>,
    pub broker_url: Option<String>,
}

impl PodEnvironment {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                JobplaneError::Configuration(format!("{} is not set in the pod environment", key))
            })
        };
        let seconds = |key: &str, default: TimeLimits| -> Result<Duration> {
            match lookup(key) {
                Some(value) => value.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    JobplaneError::Configuration(format!("{} is not a number of seconds", key))
                }),
                None if key == ENV_SOFT_LIMIT => Ok(default.soft),
                None => Ok(default.hard),
            }
        };

        let execution_id = Uuid::parse_str(&required(ENV_EXECUTION_ID)?).map_err(|e| {
            JobplaneError::Configuration(format!("{} is not a UUID: {}", ENV_EXECUTION_ID, e))
        })?;
        let arguments: JobArguments = match lookup(ENV_ARGUMENTS) {
            Some(raw) => serde_json::from_str(&raw)?,
            None => JobArguments::new(),
        };
        let defaults = TimeLimits::default();

        Ok(Self {
            execution_id,
            class_path: required(ENV_CLASS_PATH)?,
            arguments,
            limits: TimeLimits {
                soft: seconds(ENV_SOFT_LIMIT, defaults)?,
                hard: seconds(ENV_HARD_LIMIT, defaults)?,
            },
            api_url: lookup(ENV_API_URL),
            broker_url: lookup(ENV_BROKER_URL),
        })
    }
}

/// Writes [`PodLine`]s as JSON lines.
pub struct JsonLineSink<W> {
    out: Arc<Mutex<W>>,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(out: Arc<Mutex<W>>) -> Self {
        Self { out }
    }

    pub fn emit(&self, line: &PodLine) {
        let Ok(encoded) = serde_json::to_string(line) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", encoded);
            let _ = out.flush();
        }
    }
}

#[async_trait]
impl<W: Write + Send + 'static> LogSink for JsonLineSink<W> {
    async fn write(&self, record: LogRecord) {
        self.emit(&PodLine::Log(record));
    }
}

/// Run the execution described by `env`, writing its output to `out`.
/// Returns true on success.
pub async fn run_in_pod<W: Write + Send + 'static>(
    registry: &JobRegistry,
    env: PodEnvironment,
    out: Arc<Mutex<W>>,
) -> bool {
    let sink = Arc::new(JsonLineSink::new(out));

    let outcome = match registry.load_executable(&env.class_path).await {
        Ok(job) => {
            let dryrun = env
                .arguments
                .get(DRYRUN_VAR)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let ctx = JobContext::new(
                env.execution_id,
                env.class_path.clone(),
                dryrun,
                sink.clone(),
                CancellationToken::new(),
            );
            run_job(job, ctx, env.arguments, env.limits).await
        }
        Err(e) => JobOutcome::Failed {
            kind: ErrorKind::Runtime,
            summary: e.to_string(),
            detail: None,
        },
    };

    let success = outcome.is_success();
    sink.emit(&PodLine::from_outcome(outcome));
    tracing::info!(execution_id = %env.execution_id, success, "Pod execution finished");
    success
}
