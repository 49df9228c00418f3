//! The single code path that runs a job body, shared by the worker pool
//! and the in-pod runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::jobs::job::{Job, JobArguments, JobContext, JobFailure, LogRecord};
use crate::store::models::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    /// Advisory: the job is told and may wrap up.
    pub soft: Duration,
    /// Authoritative: the job is stopped.
    pub hard: Duration,
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(300),
            hard: Duration::from_secs(600),
        }
    }
}

/// Cancellation tokens of in-flight executions, shared between the
/// dispatcher (which cancels) and the executors (which register).
#[derive(Debug, Clone, Default)]
pub struct Cancellations {
    tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl Cancellations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, execution_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().await.insert(execution_id, token.clone());
        token
    }

    pub async fn remove(&self, execution_id: &Uuid) {
        self.tokens.write().await.remove(execution_id);
    }

    /// Returns false when nothing is registered for the execution.
    pub async fn cancel(&self, execution_id: &Uuid) -> bool {
        match self.tokens.read().await.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(Value),
    Failed {
        kind: ErrorKind,
        summary: String,
        detail: Option<String>,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }

    fn from_failure(failure: JobFailure) -> Self {
        let kind = if failure.cancelled {
            ErrorKind::Cancelled
        } else {
            ErrorKind::Runtime
        };
        JobOutcome::Failed {
            kind,
            summary: failure.message,
            detail: failure.detail,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `job` to completion under `limits`.
///
/// The body runs on its own task so that a panic is caught and turned into
/// a runtime failure, and so that the hard limit can abort it. When the soft
/// limit passes, a warning is logged and the context's soft-limit signal is
/// raised; the job may react or keep going until the hard limit.
pub async fn run_job(
    job: Box<dyn Job>,
    ctx: JobContext,
    args: JobArguments,
    limits: TimeLimits,
) -> JobOutcome {
    let soft_token = ctx.soft_limit_token();
    let job_ctx = ctx.clone();
    let mut handle = tokio::spawn(async move { job.run(&job_ctx, args).await });

    let soft = tokio::time::sleep(limits.soft);
    let hard = tokio::time::sleep(limits.hard);
    tokio::pin!(soft);
    tokio::pin!(hard);
    let mut soft_fired = limits.soft >= limits.hard;

    loop {
        tokio::select! {
            joined = &mut handle => {
                return match joined {
                    Ok(Ok(payload)) => JobOutcome::Success(payload),
                    Ok(Err(failure)) => JobOutcome::from_failure(failure),
                    Err(e) if e.is_panic() => {
                        let msg = panic_message(e.into_panic().as_ref());
                        JobOutcome::Failed {
                            kind: ErrorKind::Runtime,
                            summary: format!("Job panicked: {}", msg),
                            detail: None,
                        }
                    }
                    Err(e) => JobOutcome::Failed {
                        kind: ErrorKind::Runtime,
                        summary: format!("Job task did not complete: {}", e),
                        detail: None,
                    },
                };
            }
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                soft_token.cancel();
                ctx.log(LogRecord::new(
                    Severity::Warning,
                    format!("Soft time limit of {}s exceeded", limits.soft.as_secs()),
                ))
                .await;
            }
            _ = &mut hard => {
                handle.abort();
                return JobOutcome::Failed {
                    kind: ErrorKind::TimeLimit,
                    summary: format!(
                        "Time limit exceeded: job stopped after {}s",
                        limits.hard.as_secs()
                    ),
                    detail: None,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobMeta, LogSink};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecSink(Mutex<Vec<LogRecord>>);

    #[async_trait]
    impl LogSink for VecSink {
        async fn write(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    enum Behaviour {
        Return,
        Panic,
        Hang,
        WrapUpOnSoftLimit,
    }

    struct TestJob(Behaviour);

    #[async_trait]
    impl crate::jobs::job::Job for TestJob {
        fn meta(&self) -> JobMeta {
            JobMeta::new("Test")
        }

        async fn run(&self, ctx: &JobContext, _args: JobArguments) -> Result<Value, JobFailure> {
            match self.0 {
                Behaviour::Return => Ok(json!({"ok": true})),
                Behaviour::Panic => panic!("kaboom"),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }
                Behaviour::WrapUpOnSoftLimit => {
                    ctx.soft_limit_exceeded().await;
                    Ok(json!("wrapped up"))
                }
            }
        }
    }

    fn ctx(sink: Arc<VecSink>) -> JobContext {
        JobContext::new(Uuid::new_v4(), "t/t.Test", false, sink, CancellationToken::new())
    }

    fn limits(soft: u64, hard: u64) -> TimeLimits {
        TimeLimits {
            soft: Duration::from_secs(soft),
            hard: Duration::from_secs(hard),
        }
    }

    #[tokio::test]
    async fn returns_payload() {
        let sink = Arc::new(VecSink::default());
        let outcome = run_job(
            Box::new(TestJob(Behaviour::Return)),
            ctx(sink),
            JobArguments::new(),
            limits(5, 10),
        )
        .await;
        assert_eq!(outcome, JobOutcome::Success(json!({"ok": true})));
    }

    #[tokio::test]
    async fn panic_becomes_runtime_failure() {
        let sink = Arc::new(VecSink::default());
        let outcome = run_job(
            Box::new(TestJob(Behaviour::Panic)),
            ctx(sink),
            JobArguments::new(),
            limits(5, 10),
        )
        .await;
        match outcome {
            JobOutcome::Failed { kind, summary, .. } => {
                assert_eq!(kind, ErrorKind::Runtime);
                assert!(summary.contains("kaboom"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_limit_stops_job() {
        let sink = Arc::new(VecSink::default());
        let outcome = run_job(
            Box::new(TestJob(Behaviour::Hang)),
            ctx(sink.clone()),
            JobArguments::new(),
            limits(1, 2),
        )
        .await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: ErrorKind::TimeLimit,
                ..
            }
        ));
        let records = sink.0.lock().unwrap();
        assert!(records
            .iter()
            .any(|r| r.severity == Severity::Warning && r.message.contains("Soft time limit")));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_limit_lets_job_wrap_up() {
        let sink = Arc::new(VecSink::default());
        let outcome = run_job(
            Box::new(TestJob(Behaviour::WrapUpOnSoftLimit)),
            ctx(sink),
            JobArguments::new(),
            limits(1, 60),
        )
        .await;
        assert_eq!(outcome, JobOutcome::Success(json!("wrapped up")));
    }

    #[tokio::test]
    async fn cancellations_reach_registered_token() {
        let cancellations = Cancellations::new();
        let id = Uuid::new_v4();
        assert!(!cancellations.cancel(&id).await);
        let token = cancellations.register(id).await;
        assert!(cancellations.cancel(&id).await);
        assert!(token.is_cancelled());
        cancellations.remove(&id).await;
        assert!(!cancellations.cancel(&id).await);
    }
}
