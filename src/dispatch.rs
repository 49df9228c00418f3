//! Dispatcher: validates a run request, persists it, and hands it to the
//! queue's backend.
//!
//! A submission ends in one of two ways:
//! - an ad-hoc run gets a PENDING [`ExecutionResult`] right away and is
//!   routed to the worker pool or an execution pod
//! - a gated (approval) or scheduled (future / recurring) run is stored as
//!   an [`ExecutionRequest`] and dispatched later by the approval gate or
//!   the Beat

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{Capability, Principal};
use crate::error::{ErrorKind, JobplaneError, Result};
use crate::jobs::job::JobArguments;
use crate::jobs::registry::JobRegistry;
use crate::jobs::schema::DRYRUN_VAR;
use crate::pod::{LaunchSpec, PodExecutor};
use crate::runtime::{Cancellations, TimeLimits};
use crate::scheduler::recurrence::{parse_time_zone, Recurrence};
use crate::store::models::{
    ApprovalState, ExecutionQueue, ExecutionRequest, ExecutionResult, ExecutionStatus, JobRecord,
    QueueBackend,
};
use crate::store::Store;
use crate::tracker::ExecutionTracker;
use crate::worker::broker::{Broker, TaskMessage};
use crate::worker::pool::sensitive_values;

/// When and how often a submission should run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub recurrence: Recurrence,
    /// Defaults to now.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// IANA zone name; defaults to UTC.
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// Body of a run submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub job_class_path: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub arguments: JobArguments,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Label for stored requests.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Dispatched now.
    Started(ExecutionResult),
    /// Stored for approval or a later due time.
    Deferred(ExecutionRequest),
}

/// Everything `submit` resolved before deciding how to proceed.
struct Prepared {
    record: JobRecord,
    queue: ExecutionQueue,
    arguments: JobArguments,
    dryrun: bool,
}

pub struct Dispatcher {
    store: Store,
    registry: Arc<JobRegistry>,
    tracker: ExecutionTracker,
    broker: Arc<dyn Broker>,
    pods: Option<Arc<PodExecutor>>,
    cancellations: Cancellations,
    default_queue: String,
    default_limits: TimeLimits,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        registry: Arc<JobRegistry>,
        tracker: ExecutionTracker,
        broker: Arc<dyn Broker>,
        pods: Option<Arc<PodExecutor>>,
        cancellations: Cancellations,
        default_queue: impl Into<String>,
        default_limits: TimeLimits,
    ) -> Self {
        Self {
            store,
            registry,
            tracker,
            broker,
            pods,
            cancellations,
            default_queue: default_queue.into(),
            default_limits,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Validate and accept a run submission.
    ///
    /// Nothing reaches a backend unless every check passes: job present and
    /// enabled, queue allowed, caller capability, sensitive-variable rules,
    /// and the job's input schema.
    pub async fn submit(&self, principal: &Principal, run: RunRequest) -> Result<Submission> {
        principal.require(Capability::Run)?;
        let prepared = self.prepare(&run).await?;
        let record = &prepared.record;

        let schedule = run.schedule.clone().unwrap_or_default();
        schedule.recurrence.validate()?;
        let time_zone = schedule.time_zone.clone().unwrap_or_else(|| "UTC".to_string());
        let tz = parse_time_zone(&time_zone)?;
        let now = Utc::now();
        let start = schedule.start_time.unwrap_or(now);
        let scheduled = schedule.recurrence.is_recurring() || start > now;
        let needs_approval = record.approval_required() && !prepared.dryrun;

        if record.meta.has_sensitive_variables {
            if record.approval_required() {
                return Err(JobplaneError::Configuration(format!(
                    "{} has sensitive variables and cannot require approval",
                    record.class_path
                )));
            }
            if scheduled {
                return Err(JobplaneError::Configuration(format!(
                    "{} has sensitive variables and cannot be scheduled",
                    record.class_path
                )));
            }
        }

        if !needs_approval && !scheduled {
            let result = self
                .start(&prepared, None, &principal.name)
                .await?;
            return Ok(Submission::Started(result));
        }

        let request = ExecutionRequest {
            id: Uuid::new_v4(),
            name: run.name.clone().unwrap_or_else(|| record.meta.name.clone()),
            class_path: record.class_path.clone(),
            principal: principal.name.clone(),
            arguments: prepared.arguments.clone(),
            queue: prepared.queue.name.clone(),
            recurrence: schedule.recurrence.clone(),
            start_time: start,
            time_zone,
            approval: if needs_approval {
                ApprovalState::PendingApproval
            } else {
                ApprovalState::NoneRequired
            },
            approved_by: None,
            approved_at: None,
            dryrun: prepared.dryrun,
            enabled: true,
            fired: false,
            next_due_at: schedule.recurrence.initial_due(start, now, tz)?,
            last_dispatched_at: None,
            total_run_count: 0,
            created_at: now,
            version: 0,
        };
        self.store.insert_request(request.clone()).await;
        tracing::info!(
            request_id = %request.id,
            class_path = %request.class_path,
            queue = %request.queue,
            approval = %request.approval,
            next_due_at = ?request.next_due_at,
            "Execution request stored"
        );
        Ok(Submission::Deferred(request))
    }

    /// Dispatch a stored request for its current due boundary. Callers
    /// (the Beat, the approval gate) must already hold the claim.
    pub async fn dispatch_request(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        if !request.approval.allows_dispatch() {
            return Err(JobplaneError::Forbidden(format!(
                "execution request {} is {}",
                request.id, request.approval
            )));
        }
        let prepared = self.prepare(&Self::run_for(request)).await?;
        self.start(&prepared, Some(request.id), &request.principal)
            .await
    }

    /// Resolve a stored request against the current registry and queues
    /// without dispatching anything.
    pub async fn check_request(&self, request: &ExecutionRequest) -> Result<()> {
        self.prepare(&Self::run_for(request)).await.map(|_| ())
    }

    fn run_for(request: &ExecutionRequest) -> RunRequest {
        RunRequest {
            job_class_path: request.class_path.clone(),
            queue: Some(request.queue.clone()),
            arguments: request.arguments.clone(),
            schedule: None,
            name: Some(request.name.clone()),
        }
    }

    /// Refresh the registry, then resolve job, queue and arguments.
    async fn prepare(&self, run: &RunRequest) -> Result<Prepared> {
        self.registry.refresh().await?;

        let record = self.registry.lookup(&run.job_class_path).await?;
        if record.missing {
            return Err(JobplaneError::Load {
                class_path: record.class_path,
                reason: "no longer offered by any job source".to_string(),
            });
        }
        if !record.enabled() {
            return Err(JobplaneError::JobDisabled(record.class_path));
        }

        let queue_name = run
            .queue
            .clone()
            .unwrap_or_else(|| record.default_queue(&self.default_queue).to_string());
        let queue = self.store.get_queue(&queue_name).await.ok_or_else(|| {
            JobplaneError::Configuration(format!("queue {} is not configured", queue_name))
        })?;
        if !record.allows_queue(&queue.name, &self.default_queue) {
            return Err(JobplaneError::Configuration(format!(
                "{} may not run on queue {}",
                record.class_path, queue.name
            )));
        }
        if matches!(queue.backend, QueueBackend::OrchestratorPod { .. }) && self.pods.is_none() {
            return Err(JobplaneError::Configuration(format!(
                "queue {} needs an orchestrator but none is configured",
                queue.name
            )));
        }

        let arguments = record.schema.validate(&run.arguments)?;
        let dryrun = arguments
            .get(DRYRUN_VAR)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Prepared {
            record,
            queue,
            arguments,
            dryrun,
        })
    }

    /// Create the PENDING result and hand it to the backend.
    async fn start(
        &self,
        prepared: &Prepared,
        request_id: Option<Uuid>,
        principal: &str,
    ) -> Result<ExecutionResult> {
        let record = &prepared.record;
        let result = ExecutionResult::new(
            &record.class_path,
            &record.meta.name,
            &prepared.queue,
            request_id,
            principal,
        );
        let execution_id = result.id;
        let singleton = record.meta.is_singleton.then_some(record.class_path.as_str());
        self.store.insert_result(result, singleton).await?;

        let secrets = sensitive_values(&record.schema.sensitive_names(), &prepared.arguments);
        self.tracker.register_secrets(execution_id, secrets).await;

        tracing::info!(
            execution_id = %execution_id,
            class_path = %record.class_path,
            queue = %prepared.queue.name,
            backend = %prepared.queue.kind(),
            request_id = ?request_id,
            "Dispatching execution"
        );

        match &prepared.queue.backend {
            QueueBackend::WorkerPool { topic } => {
                let message = TaskMessage {
                    execution_result_id: execution_id,
                    job_class_path: record.class_path.clone(),
                    arguments: prepared.arguments.clone(),
                };
                if let Err(e) = self.broker.publish(topic, &message).await {
                    let reason = format!("could not enqueue on {}: {}", topic, e);
                    self.tracker
                        .fail(
                            execution_id,
                            ErrorKind::Dispatch,
                            format!("Backend unavailable: {}", reason),
                            None,
                        )
                        .await?;
                    return Err(JobplaneError::Dispatch(format!(
                        "execution {}: {}",
                        execution_id, reason
                    )));
                }
            }
            QueueBackend::OrchestratorPod { namespace, image } => {
                let pods = self.pods.as_ref().ok_or_else(|| {
                    JobplaneError::Internal("orchestrator-pod queue without executor".to_string())
                })?;
                let spec = LaunchSpec {
                    execution_id,
                    class_path: record.class_path.clone(),
                    arguments: prepared.arguments.clone(),
                    namespace: namespace.clone(),
                    image: image.clone(),
                    limits: record.time_limits(self.default_limits),
                };
                pods.launch(spec).await.map_err(|e| match e {
                    JobplaneError::Dispatch(msg) => {
                        JobplaneError::Dispatch(format!("execution {}: {}", execution_id, msg))
                    }
                    other => other,
                })?;
            }
        }

        self.store
            .get_result(&execution_id)
            .await
            .ok_or_else(|| JobplaneError::NotFound(format!("execution {}", execution_id)))
    }

    /// Cancel an execution.
    ///
    /// PENDING executions fail right away. Running ones are signalled: a
    /// worker slot sees its token cancelled, a pod supervisor deletes the
    /// pod. Either way the result ends with kind `cancelled`.
    pub async fn cancel(&self, principal: &Principal, execution_id: &Uuid) -> Result<ExecutionResult> {
        principal.require(Capability::Run)?;
        let result = self.store.request_cancel(execution_id).await?;
        tracing::info!(execution_id = %execution_id, principal = %principal.name, "Cancellation requested");

        if result.status == ExecutionStatus::Pending {
            match self
                .tracker
                .fail(
                    *execution_id,
                    ErrorKind::Cancelled,
                    format!("Cancelled by {} before it started", principal.name),
                    None,
                )
                .await
            {
                Ok(result) => return Ok(result),
                // Picked up in the meantime; signal the running copy instead.
                Err(JobplaneError::InvalidTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.cancellations.cancel(execution_id).await {
            tracing::warn!(execution_id = %execution_id, "No running copy to signal");
        }
        self.store
            .get_result(execution_id)
            .await
            .ok_or_else(|| JobplaneError::NotFound(format!("execution {}", execution_id)))
    }
}
