use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorKind, Result};
use crate::jobs::job::{JobArguments, JobContext};
use crate::jobs::registry::JobRegistry;
use crate::jobs::schema::DRYRUN_VAR;
use crate::runtime::{run_job, Cancellations, TimeLimits};
use crate::tracker::ExecutionTracker;
use crate::worker::broker::{Broker, TaskMessage};

/// How long a slot blocks on the broker before re-checking for shutdown.
const CONSUME_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after a broker error before consuming again.
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Literal values of a job's sensitive variables, for log scrubbing.
pub fn sensitive_values(names: &[&str], args: &JobArguments) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| args.get(*name))
        .filter_map(|value| match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect()
}

/// Pool of worker slots consuming tasks from the broker. Each slot runs at
/// most one job at a time.
pub struct WorkerPool {
    registry: Arc<JobRegistry>,
    tracker: ExecutionTracker,
    broker: Arc<dyn Broker>,
    cancellations: Cancellations,
    topics: Vec<String>,
    concurrency: usize,
    defaults: TimeLimits,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<JobRegistry>,
        tracker: ExecutionTracker,
        broker: Arc<dyn Broker>,
        cancellations: Cancellations,
        topics: Vec<String>,
        concurrency: usize,
        defaults: TimeLimits,
    ) -> Self {
        Self {
            registry,
            tracker,
            broker,
            cancellations,
            topics,
            concurrency: concurrency.max(1),
            defaults,
        }
    }

    /// Start every slot. Slots finish their current job before observing
    /// `shutdown`.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            concurrency = self.concurrency,
            topics = ?self.topics,
            "Starting worker pool"
        );
        (0..self.concurrency)
            .map(|slot| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.slot_loop(slot, shutdown).await })
            })
            .collect()
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        let name = format!("worker-{}", slot);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker = %name, "Worker slot stopping");
                    break;
                }
                consumed = self.broker.consume(&self.topics, CONSUME_TIMEOUT) => match consumed {
                    Ok(Some(message)) => {
                        let execution_id = message.execution_result_id;
                        if let Err(e) = self.execute(&name, message).await {
                            tracing::error!(
                                worker = %name,
                                execution_id = %execution_id,
                                error = %e,
                                "Failed to record execution outcome"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(worker = %name, error = %e, "Broker consume failed");
                        tokio::time::sleep(BROKER_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    /// Run one task on the slot named `handle`.
    pub async fn execute(&self, handle: &str, message: TaskMessage) -> Result<()> {
        let execution_id = message.execution_result_id;
        let store = self.tracker.store();

        let Some(result) = store.get_result(&execution_id).await else {
            tracing::warn!(execution_id = %execution_id, "Task references unknown execution, dropping");
            return Ok(());
        };
        if result.status.is_terminal() {
            tracing::info!(
                execution_id = %execution_id,
                status = %result.status,
                "Execution already finished before it was picked up, skipping"
            );
            return Ok(());
        }

        let cancel = self.cancellations.register(execution_id).await;
        let outcome = self.run(handle, execution_id, message, cancel).await;
        self.cancellations.remove(&execution_id).await;
        outcome
    }

    async fn run(
        &self,
        handle: &str,
        execution_id: Uuid,
        message: TaskMessage,
        cancel: CancellationToken,
    ) -> Result<()> {
        let running = match self.tracker.mark_running(execution_id, Some(handle)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::info!(execution_id = %execution_id, error = %e, "Execution not runnable, skipping");
                return Ok(());
            }
        };
        if running.cancel_requested {
            cancel.cancel();
        }

        let limits = match self.registry.lookup(&message.job_class_path).await {
            Ok(record) => {
                let secrets =
                    sensitive_values(&record.schema.sensitive_names(), &message.arguments);
                self.tracker.register_secrets(execution_id, secrets).await;
                record.time_limits(self.defaults)
            }
            Err(_) => self.defaults,
        };

        let job = match self.registry.load_executable(&message.job_class_path).await {
            Ok(job) => job,
            Err(e) => {
                self.tracker
                    .fail(execution_id, ErrorKind::Runtime, e.to_string(), None)
                    .await?;
                return Ok(());
            }
        };

        let dryrun = message
            .arguments
            .get(DRYRUN_VAR)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let ctx = JobContext::new(
            execution_id,
            message.job_class_path.clone(),
            dryrun,
            self.tracker.sink(execution_id),
            cancel,
        );

        tracing::info!(
            execution_id = %execution_id,
            class_path = %message.job_class_path,
            worker = %handle,
            "Executing job"
        );
        let outcome = run_job(job, ctx, message.arguments, limits).await;
        self.tracker.finish(execution_id, outcome).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_values_skip_missing_and_empty() {
        let args = json!({"password": "pw", "token": "", "count": 3, "pin": 1234})
            .as_object()
            .cloned()
            .unwrap();
        let values = sensitive_values(&["password", "token", "missing", "pin"], &args);
        assert_eq!(values, vec!["pw".to_string(), "1234".to_string()]);
    }
}
