use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::PodConfig;
use crate::error::{ErrorKind, JobplaneError, Result};
use crate::pod::manifest::{build_manifest, pod_name, LaunchSpec};
use crate::pod::orchestrator::{Orchestrator, OrchestratorError, PodPhase, PodStatus};
use crate::pod::runner::PodLine;
use crate::runtime::Cancellations;
use crate::store::models::{ExecutionResult, Severity};
use crate::tracker::ExecutionTracker;

/// A pod whose deletion failed and may still be running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanRecord {
    pub pod: String,
    pub namespace: String,
    pub execution_id: Uuid,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Failed deletions, surfaced to operators.
#[derive(Debug, Clone, Default)]
pub struct OrphanLedger {
    entries: Arc<RwLock<Vec<OrphanRecord>>>,
}

impl OrphanLedger {
    pub async fn record(&self, record: OrphanRecord) {
        self.entries.write().await.push(record);
    }

    pub async fn list(&self) -> Vec<OrphanRecord> {
        self.entries.read().await.clone()
    }
}

/// How a supervised pod stopped being watched.
#[derive(Debug)]
enum PodEnd {
    Finished(PodStatus),
    Cancelled,
    DeadlineExceeded,
    Lost(String),
}

/// Parsed pod output.
#[derive(Debug, Default)]
struct PodReport {
    payload: Option<Value>,
    error: Option<(ErrorKind, String, Option<String>)>,
}

#[derive(Debug, Clone)]
struct Supervised {
    execution_id: Uuid,
    pod: String,
    namespace: String,
    hard_limit: Duration,
}

/// Launches one pod per execution and supervises it with its own task.
///
/// The supervisor polls the pod until it reaches a terminal phase, the
/// execution is cancelled, or its own deadline passes, then records the
/// outcome and deletes the pod. Deletion runs on every exit path; a failed
/// delete is logged against the execution and added to the orphan ledger.
pub struct PodExecutor {
    orchestrator: Arc<dyn Orchestrator>,
    tracker: ExecutionTracker,
    cancellations: Cancellations,
    config: PodConfig,
    orphans: OrphanLedger,
    supervisors: TaskTracker,
}

impl PodExecutor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        tracker: ExecutionTracker,
        cancellations: Cancellations,
        config: PodConfig,
    ) -> Self {
        Self {
            orchestrator,
            tracker,
            cancellations,
            config,
            orphans: OrphanLedger::default(),
            supervisors: TaskTracker::new(),
        }
    }

    pub fn orphans(&self) -> &OrphanLedger {
        &self.orphans
    }

    /// Create the pod for a PENDING execution and start its supervisor.
    ///
    /// If the orchestrator rejects or cannot receive the create call, the
    /// execution fails with kind `dispatch` and no pod is assumed to exist.
    pub async fn launch(self: &Arc<Self>, spec: LaunchSpec) -> Result<()> {
        let execution_id = spec.execution_id;
        let name = pod_name(&execution_id);
        let manifest = build_manifest(&spec, &self.config)?;

        self.tracker
            .log_message(
                execution_id,
                Severity::Info,
                format!("creating execution pod {}", name),
            )
            .await;
        tracing::info!(
            execution_id = %execution_id,
            pod = %name,
            namespace = %spec.namespace,
            image = %spec.image,
            "Creating execution pod"
        );

        if let Err(e) = self.orchestrator.create_pod(&manifest).await {
            let summary = format!("Backend unavailable: could not create execution pod {}: {}", name, e);
            self.tracker
                .fail(execution_id, ErrorKind::Dispatch, summary.clone(), None)
                .await?;
            return Err(JobplaneError::Dispatch(summary));
        }

        let cancel = self.cancellations.register(execution_id).await;
        let supervised = Supervised {
            execution_id,
            pod: name,
            namespace: spec.namespace,
            hard_limit: spec.limits.hard,
        };
        if let Err(e) = self.tracker.mark_running(execution_id, Some(&supervised.pod)).await {
            // Cancelled while the create call was in flight.
            self.cleanup(&supervised).await;
            self.cancellations.remove(&execution_id).await;
            return Err(e);
        }

        let executor = self.clone();
        self.supervisors
            .spawn(async move { executor.supervise(supervised, cancel).await });
        Ok(())
    }

    /// Wait for every supervisor to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.supervisors.close();
        tokio::time::timeout(timeout, self.supervisors.wait())
            .await
            .is_ok()
    }

    async fn supervise(self: Arc<Self>, pod: Supervised, cancel: CancellationToken) {
        let watched = std::panic::AssertUnwindSafe(self.watch_and_record(&pod, &cancel))
            .catch_unwind()
            .await;
        if watched.is_err() {
            tracing::error!(execution_id = %pod.execution_id, pod = %pod.pod, "Pod supervisor panicked");
            let recorded = self
                .tracker
                .fail(
                    pod.execution_id,
                    ErrorKind::BackendLost,
                    format!("Supervision of execution pod {} failed unexpectedly", pod.pod),
                    None,
                )
                .await;
            if let Err(e) = recorded {
                tracing::warn!(execution_id = %pod.execution_id, error = %e, "Could not record pod outcome");
            }
        }

        self.cleanup(&pod).await;
        self.cancellations.remove(&pod.execution_id).await;
    }

    async fn watch_and_record(&self, pod: &Supervised, cancel: &CancellationToken) {
        self.tracker
            .log_message(
                pod.execution_id,
                Severity::Info,
                format!("reading execution pod {}", pod.pod),
            )
            .await;

        let end = self.watch(pod, cancel).await;
        tracing::info!(execution_id = %pod.execution_id, pod = %pod.pod, end = ?end, "Stopped watching execution pod");

        let report = match end {
            PodEnd::Lost(_) => PodReport::default(),
            _ => self.collect_output(pod).await,
        };

        let recorded = match end {
            PodEnd::Finished(status) => self.record_finished(pod, status, report).await,
            PodEnd::Cancelled => {
                self.tracker
                    .fail(
                        pod.execution_id,
                        ErrorKind::Cancelled,
                        format!("Execution cancelled; deleting execution pod {}", pod.pod),
                        None,
                    )
                    .await
            }
            PodEnd::DeadlineExceeded => {
                self.tracker
                    .fail(
                        pod.execution_id,
                        ErrorKind::TimeLimit,
                        format!(
                            "Time limit exceeded: execution pod {} still running after {}s",
                            pod.pod,
                            pod.hard_limit.as_secs()
                        ),
                        None,
                    )
                    .await
            }
            PodEnd::Lost(reason) => {
                self.tracker
                    .fail(
                        pod.execution_id,
                        ErrorKind::BackendLost,
                        format!("Lost track of execution pod {}: {}", pod.pod, reason),
                        None,
                    )
                    .await
            }
        };
        if let Err(e) = recorded {
            tracing::warn!(execution_id = %pod.execution_id, error = %e, "Could not record pod outcome");
        }
    }

    /// Poll until the pod ends, with backoff on read errors.
    async fn watch(&self, pod: &Supervised, cancel: &CancellationToken) -> PodEnd {
        let interval = self.config.poll_interval();
        let deadline = tokio::time::Instant::now() + pod.hard_limit + interval;
        let mut delay = interval;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PodEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return PodEnd::DeadlineExceeded,
                _ = tokio::time::sleep(delay) => {}
            }

            match self
                .orchestrator
                .pod_status(&pod.namespace, &pod.pod)
                .await
            {
                Ok(status) => {
                    failures = 0;
                    delay = interval;
                    if status.phase.is_terminal() {
                        return PodEnd::Finished(status);
                    }
                }
                Err(OrchestratorError::NotFound(_)) => {
                    return PodEnd::Lost("pod no longer exists".to_string());
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        execution_id = %pod.execution_id,
                        pod = %pod.pod,
                        failures,
                        error = %e,
                        "Failed to read execution pod status"
                    );
                    if failures >= self.config.max_poll_failures {
                        return PodEnd::Lost(e.to_string());
                    }
                    delay = backoff_with_jitter(delay, self.config.max_backoff());
                }
            }
        }
    }

    /// Fetch the pod's output and turn it into log entries. Bounded by one
    /// poll interval so that deletion is never held up for long.
    async fn collect_output(&self, pod: &Supervised) -> PodReport {
        let fetched = tokio::time::timeout(
            self.config.poll_interval(),
            self.orchestrator.pod_logs(&pod.namespace, &pod.pod),
        )
        .await;

        let text = match fetched {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                self.log_retrieval_failure(pod, &e.to_string()).await;
                return PodReport::default();
            }
            Err(_) => {
                self.log_retrieval_failure(pod, "timed out").await;
                return PodReport::default();
            }
        };

        let mut report = PodReport::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match PodLine::parse(line) {
                Some(PodLine::Log(record)) => {
                    self.tracker.log(pod.execution_id, record).await;
                }
                Some(PodLine::Result { payload }) => report.payload = Some(payload),
                Some(PodLine::Error {
                    kind,
                    summary,
                    detail,
                }) => report.error = Some((kind, summary, detail)),
                None => {
                    self.tracker
                        .log_message(pod.execution_id, Severity::Info, line)
                        .await;
                }
            }
        }
        report
    }

    async fn log_retrieval_failure(&self, pod: &Supervised, reason: &str) {
        tracing::warn!(execution_id = %pod.execution_id, pod = %pod.pod, error = reason, "Failed to retrieve pod logs");
        self.tracker
            .log_message(
                pod.execution_id,
                Severity::Warning,
                format!("failed to retrieve logs from execution pod {}: {}", pod.pod, reason),
            )
            .await;
    }

    async fn record_finished(
        &self,
        pod: &Supervised,
        status: PodStatus,
        report: PodReport,
    ) -> Result<ExecutionResult> {
        let id = pod.execution_id;
        match status.phase {
            PodPhase::Succeeded => {
                self.tracker
                    .succeed(id, report.payload.unwrap_or(Value::Null))
                    .await
            }
            _ if status.deadline_exceeded() => {
                self.tracker
                    .fail(
                        id,
                        ErrorKind::TimeLimit,
                        format!(
                            "Time limit exceeded: execution pod {} stopped by the orchestrator after {}s",
                            pod.pod,
                            pod.hard_limit.as_secs()
                        ),
                        None,
                    )
                    .await
            }
            _ => match report.error {
                Some((kind, summary, detail)) => self.tracker.fail(id, kind, summary, detail).await,
                None => {
                    let reason = status
                        .message
                        .or(status.reason)
                        .unwrap_or_else(|| "no output from job".to_string());
                    self.tracker
                        .fail(
                            id,
                            ErrorKind::Runtime,
                            format!("Execution pod {} failed: {}", pod.pod, reason),
                            None,
                        )
                        .await
                }
            },
        }
    }

    /// Best-effort delete. Failure is logged and recorded, never raised.
    async fn cleanup(&self, pod: &Supervised) {
        self.tracker
            .log_message(
                pod.execution_id,
                Severity::Info,
                format!("deleting execution pod {}", pod.pod),
            )
            .await;

        let deleted = std::panic::AssertUnwindSafe(
            self.orchestrator.delete_pod(&pod.namespace, &pod.pod),
        )
        .catch_unwind()
        .await;
        let error = match deleted {
            Ok(Ok(())) | Ok(Err(OrchestratorError::NotFound(_))) => {
                tracing::info!(execution_id = %pod.execution_id, pod = %pod.pod, "Execution pod deleted");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "delete call panicked".to_string(),
        };

        tracing::warn!(
            execution_id = %pod.execution_id,
            pod = %pod.pod,
            namespace = %pod.namespace,
            orphaned = true,
            error = %error,
            "Execution pod could not be deleted"
        );
        self.tracker
            .log_message(
                pod.execution_id,
                Severity::Warning,
                format!("failed to delete execution pod {}: {}", pod.pod, error),
            )
            .await;
        self.orphans
            .record(OrphanRecord {
                pod: pod.pod.clone(),
                namespace: pod.namespace.clone(),
                execution_id: pod.execution_id,
                error,
                recorded_at: Utc::now(),
            })
            .await;
    }
}

/// Doubles `delay` up to `max`, then adds up to 10% random jitter so that
/// supervisors backing off together do not hit the API in lockstep.
fn backoff_with_jitter(delay: Duration, max: Duration) -> Duration {
    let doubled = (delay * 2).min(max);
    let spread = (doubled.as_millis() as u64 / 10).max(1);
    let jitter = rand::thread_rng().gen_range(0..=spread);
    doubled + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(30);
        let next = backoff_with_jitter(Duration::from_secs(2), max);
        assert!(next >= Duration::from_secs(4));
        assert!(next <= Duration::from_millis(4400));

        let capped = backoff_with_jitter(Duration::from_secs(20), max);
        assert!(capped >= max);
        assert!(capped <= Duration::from_secs(33));
    }
}
