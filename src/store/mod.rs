//! Shared mutable state: the Job Record Store plus execution rows.
//!
//! Every mutation is a keyed row update performed inside a single write-lock
//! section, and the ones that other writers may race on are conditional:
//!
//! - [`Store::update_request`] compares the row version before writing
//! - [`Store::claim_due`] compares the due timestamp (the Beat's idempotent claim)
//! - [`Store::transition_result`] only applies legal status transitions
//! - [`Store::insert_result`] checks singleton exclusivity atomically with the insert

pub mod models;
pub mod retention;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{JobplaneError, Result};
use crate::jobs::job::JobMeta;
use crate::jobs::schema::InputSchema;
use models::{
    ExecutionQueue, ExecutionRequest, ExecutionResult, ExecutionStatus, JobOverrides, JobRecord,
    LogEntry,
};

/// Outcome of upserting a job record during a registry refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<String, JobRecord>,
    queues: HashMap<String, ExecutionQueue>,
    requests: HashMap<Uuid, ExecutionRequest>,
    results: HashMap<Uuid, ExecutionResult>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
}

impl StoreState {
    fn has_live_execution(&self, pred: impl Fn(&ExecutionResult) -> bool) -> bool {
        self.results
            .values()
            .any(|r| !r.status.is_terminal() && pred(r))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<StoreState>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Job records
    // ---------------------------------------------------------------------

    /// Insert a newly discovered job or refresh its declared metadata,
    /// keeping operator overrides intact.
    pub async fn upsert_job(
        &self,
        class_path: &str,
        source: &str,
        meta: JobMeta,
        schema: InputSchema,
    ) -> Upsert {
        let mut state = self.inner.write().await;
        match state.jobs.get_mut(class_path) {
            Some(record) => {
                let changed = record.meta != meta
                    || record.schema != schema
                    || record.source != source
                    || record.missing;
                record.meta = meta;
                record.schema = schema;
                record.source = source.to_string();
                record.missing = false;
                record.refreshed_at = Utc::now();
                if changed {
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
            None => {
                state.jobs.insert(
                    class_path.to_string(),
                    JobRecord::new(class_path.to_string(), source.to_string(), meta, schema),
                );
                Upsert::Added
            }
        }
    }

    /// Flag every record not in `present` as missing. Records are never
    /// removed, so execution history keeps pointing at a valid definition.
    pub async fn mark_missing_jobs(&self, present: &HashSet<String>) -> Vec<String> {
        let mut state = self.inner.write().await;
        let mut newly_missing = Vec::new();
        for record in state.jobs.values_mut() {
            if !present.contains(&record.class_path) && !record.missing {
                record.missing = true;
                newly_missing.push(record.class_path.clone());
            }
        }
        newly_missing.sort();
        newly_missing
    }

    pub async fn get_job(&self, class_path: &str) -> Option<JobRecord> {
        self.inner.read().await.jobs.get(class_path).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        let state = self.inner.read().await;
        let mut jobs: Vec<JobRecord> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.class_path.cmp(&b.class_path));
        jobs
    }

    pub async fn set_job_overrides(
        &self,
        class_path: &str,
        overrides: JobOverrides,
    ) -> Result<JobRecord> {
        let mut state = self.inner.write().await;
        let record = state
            .jobs
            .get_mut(class_path)
            .ok_or_else(|| JobplaneError::NotFound(format!("job {}", class_path)))?;
        if record.meta.has_sensitive_variables && overrides.approval_required == Some(true) {
            return Err(JobplaneError::Configuration(format!(
                "{} has sensitive variables and cannot require approval",
                class_path
            )));
        }
        if let (Some(soft), Some(hard)) = (
            overrides.soft_time_limit_secs.or(record.meta.soft_time_limit_secs),
            overrides.hard_time_limit_secs.or(record.meta.hard_time_limit_secs),
        ) {
            if hard < soft {
                return Err(JobplaneError::Configuration(
                    "hard time limit must not be lower than the soft time limit".to_string(),
                ));
            }
        }
        record.overrides = overrides;
        Ok(record.clone())
    }

    // ---------------------------------------------------------------------
    // Queues
    // ---------------------------------------------------------------------

    /// Register or replace a queue. A queue referenced by in-flight
    /// executions cannot change its backend binding.
    pub async fn put_queue(&self, queue: ExecutionQueue) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(existing) = state.queues.get(&queue.name) {
            if *existing == queue {
                return Ok(());
            }
            if state.has_live_execution(|r| r.queue == queue.name) {
                return Err(JobplaneError::Conflict(format!(
                    "queue {} has in-flight executions",
                    queue.name
                )));
            }
        }
        state.queues.insert(queue.name.clone(), queue);
        Ok(())
    }

    pub async fn get_queue(&self, name: &str) -> Option<ExecutionQueue> {
        self.inner.read().await.queues.get(name).cloned()
    }

    pub async fn list_queues(&self) -> Vec<ExecutionQueue> {
        let state = self.inner.read().await;
        let mut queues: Vec<ExecutionQueue> = state.queues.values().cloned().collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }

    // ---------------------------------------------------------------------
    // Execution requests
    // ---------------------------------------------------------------------

    pub async fn insert_request(&self, request: ExecutionRequest) {
        self.inner
            .write()
            .await
            .requests
            .insert(request.id, request);
    }

    pub async fn get_request(&self, id: &Uuid) -> Option<ExecutionRequest> {
        self.inner.read().await.requests.get(id).cloned()
    }

    pub async fn list_requests(&self) -> Vec<ExecutionRequest> {
        let state = self.inner.read().await;
        let mut requests: Vec<ExecutionRequest> = state.requests.values().cloned().collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Apply `f` only if the row is still at `expected_version`.
    pub async fn update_request<F>(
        &self,
        id: &Uuid,
        expected_version: u64,
        f: F,
    ) -> Result<ExecutionRequest>
    where
        F: FnOnce(&mut ExecutionRequest),
    {
        let mut state = self.inner.write().await;
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| JobplaneError::NotFound(format!("execution request {}", id)))?;
        if request.version != expected_version {
            return Err(JobplaneError::Conflict(format!(
                "execution request {} was modified concurrently",
                id
            )));
        }
        f(request);
        request.version += 1;
        Ok(request.clone())
    }

    /// Requests whose next due time has passed, oldest first.
    pub async fn due_requests(&self, now: DateTime<Utc>) -> Vec<ExecutionRequest> {
        let state = self.inner.read().await;
        let mut due: Vec<ExecutionRequest> = state
            .requests
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_due_at);
        due
    }

    /// Claim the `(request, due_at)` pair. Only one caller ever wins a given
    /// pair, so concurrent Beats cannot double-fire a boundary.
    pub async fn claim_due(
        &self,
        id: &Uuid,
        due_at: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.inner.write().await;
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| JobplaneError::NotFound(format!("execution request {}", id)))?;

        if request.fired
            || !request.enabled
            || !request.approval.allows_dispatch()
            || request.next_due_at != Some(due_at)
            || request.last_dispatched_at == Some(due_at)
        {
            return Ok(false);
        }

        request.last_dispatched_at = Some(due_at);
        request.next_due_at = next_due;
        request.fired = next_due.is_none();
        request.total_run_count += 1;
        request.version += 1;
        Ok(true)
    }

    /// Undo a claim on `due_at` whose dispatch never created an execution,
    /// so the boundary becomes due again. A no-op if the request has moved
    /// on since.
    pub async fn release_claim(
        &self,
        id: &Uuid,
        due_at: DateTime<Utc>,
        previous_dispatch: Option<DateTime<Utc>>,
    ) -> Result<ExecutionRequest> {
        let mut state = self.inner.write().await;
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| JobplaneError::NotFound(format!("execution request {}", id)))?;
        if request.last_dispatched_at == Some(due_at) {
            request.last_dispatched_at = previous_dispatch;
            request.next_due_at = Some(due_at);
            request.fired = false;
            request.total_run_count = request.total_run_count.saturating_sub(1);
            request.version += 1;
        }
        Ok(request.clone())
    }

    // ---------------------------------------------------------------------
    // Execution results
    // ---------------------------------------------------------------------

    /// Insert a new PENDING result. When `singleton_job` is set, the insert
    /// fails with `Conflict` if that job already has a non-terminal result,
    /// which also covers every request of that job.
    pub async fn insert_result(
        &self,
        result: ExecutionResult,
        singleton_job: Option<&str>,
    ) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(class_path) = singleton_job {
            if state.has_live_execution(|r| r.class_path == class_path) {
                return Err(JobplaneError::Conflict(format!(
                    "job {} already has an execution in progress",
                    class_path
                )));
            }
        }
        state.results.insert(result.id, result);
        Ok(())
    }

    pub async fn get_result(&self, id: &Uuid) -> Option<ExecutionResult> {
        self.inner.read().await.results.get(id).cloned()
    }

    /// Most recent first.
    pub async fn list_results(&self, limit: usize) -> Vec<ExecutionResult> {
        let state = self.inner.read().await;
        let mut results: Vec<ExecutionResult> = state.results.values().cloned().collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        results
    }

    pub async fn results_for_request(&self, request_id: &Uuid) -> Vec<ExecutionResult> {
        let state = self.inner.read().await;
        let mut results: Vec<ExecutionResult> = state
            .results
            .values()
            .filter(|r| r.request_id.as_ref() == Some(request_id))
            .cloned()
            .collect();
        results.sort_by_key(|r| r.created_at);
        results
    }

    /// Move a result to `next` if the state machine allows it, stamping the
    /// start/finish time and applying `f` in the same write.
    pub async fn transition_result<F>(
        &self,
        id: &Uuid,
        next: ExecutionStatus,
        f: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce(&mut ExecutionResult),
    {
        let mut state = self.inner.write().await;
        let result = state
            .results
            .get_mut(id)
            .ok_or_else(|| JobplaneError::NotFound(format!("execution {}", id)))?;
        if !result.status.can_transition_to(next) {
            return Err(JobplaneError::InvalidTransition(format!(
                "execution {} cannot move from {} to {}",
                id, result.status, next
            )));
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            result.started_at = Some(now);
        }
        if next.is_terminal() {
            result.finished_at = Some(now);
        }
        result.status = next;
        f(result);
        result.version += 1;
        Ok(result.clone())
    }

    /// Flag a non-terminal result for cancellation.
    pub async fn request_cancel(&self, id: &Uuid) -> Result<ExecutionResult> {
        let mut state = self.inner.write().await;
        let result = state
            .results
            .get_mut(id)
            .ok_or_else(|| JobplaneError::NotFound(format!("execution {}", id)))?;
        if result.status.is_terminal() {
            return Err(JobplaneError::Conflict(format!(
                "execution {} already finished with {}",
                id, result.status
            )));
        }
        result.cancel_requested = true;
        result.version += 1;
        Ok(result.clone())
    }

    // ---------------------------------------------------------------------
    // Logs
    // ---------------------------------------------------------------------

    pub async fn append_log(&self, entry: LogEntry) {
        self.inner
            .write()
            .await
            .logs
            .entry(entry.execution_id)
            .or_default()
            .push(entry);
    }

    /// Full log of an execution in write order.
    pub async fn logs(&self, execution_id: &Uuid) -> Vec<LogEntry> {
        self.inner
            .read()
            .await
            .logs
            .get(execution_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn log_tail(&self, execution_id: &Uuid, lines: usize) -> Vec<LogEntry> {
        let state = self.inner.read().await;
        match state.logs.get(execution_id) {
            Some(entries) => {
                let start = entries.len().saturating_sub(lines);
                entries[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Retention: drop terminal results that finished before `cutoff`
    /// together with their log. Returns the number of results removed.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.inner.write().await;
        let expired: Vec<Uuid> = state
            .results
            .values()
            .filter(|r| r.status.is_terminal() && r.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|r| r.id)
            .collect();
        for id in &expired {
            state.results.remove(id);
            state.logs.remove(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobArguments;
    use crate::scheduler::recurrence::Recurrence;
    use models::{ApprovalState, QueueBackend};

    fn queue() -> ExecutionQueue {
        ExecutionQueue {
            name: "default".into(),
            backend: QueueBackend::WorkerPool {
                topic: "default".into(),
            },
        }
    }

    fn request(next_due: DateTime<Utc>) -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            name: "nightly".into(),
            class_path: "local/a.A".into(),
            principal: "alice".into(),
            arguments: JobArguments::new(),
            queue: "default".into(),
            recurrence: Recurrence::hourly(),
            start_time: next_due,
            time_zone: "UTC".into(),
            approval: ApprovalState::NoneRequired,
            approved_by: None,
            approved_at: None,
            dryrun: false,
            enabled: true,
            fired: false,
            next_due_at: Some(next_due),
            last_dispatched_at: None,
            total_run_count: 0,
            created_at: Utc::now(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn claim_due_is_won_once() {
        let store = Store::new();
        let due = Utc::now();
        let req = request(due);
        let id = req.id;
        store.insert_request(req).await;

        let next = due + chrono::Duration::hours(1);
        assert!(store.claim_due(&id, due, Some(next)).await.unwrap());
        assert!(!store.claim_due(&id, due, Some(next)).await.unwrap());

        let stored = store.get_request(&id).await.unwrap();
        assert_eq!(stored.next_due_at, Some(next));
        assert_eq!(stored.total_run_count, 1);
    }

    #[tokio::test]
    async fn released_claim_can_be_claimed_again() {
        let store = Store::new();
        let due = Utc::now();
        let req = request(due);
        let id = req.id;
        store.insert_request(req).await;

        assert!(store.claim_due(&id, due, None).await.unwrap());
        let released = store.release_claim(&id, due, None).await.unwrap();
        assert!(!released.fired);
        assert_eq!(released.next_due_at, Some(due));
        assert_eq!(released.total_run_count, 0);

        assert!(store.claim_due(&id, due, None).await.unwrap());
        assert!(store.get_request(&id).await.unwrap().fired);
    }

    #[tokio::test]
    async fn update_request_rejects_stale_version() {
        let store = Store::new();
        let req = request(Utc::now());
        let id = req.id;
        store.insert_request(req).await;

        store.update_request(&id, 0, |r| r.enabled = false).await.unwrap();
        let err = store
            .update_request(&id, 0, |r| r.enabled = true)
            .await
            .unwrap_err();
        assert!(matches!(err, JobplaneError::Conflict(_)));
    }

    #[tokio::test]
    async fn terminal_results_are_immutable() {
        let store = Store::new();
        let result = ExecutionResult::new("local/a.A", "A", &queue(), None, "alice");
        let id = result.id;
        store.insert_result(result, None).await.unwrap();

        store
            .transition_result(&id, ExecutionStatus::Running, |_| {})
            .await
            .unwrap();
        store
            .transition_result(&id, ExecutionStatus::Success, |_| {})
            .await
            .unwrap();
        let err = store
            .transition_result(&id, ExecutionStatus::Failure, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, JobplaneError::InvalidTransition(_)));
        assert_eq!(
            store.get_result(&id).await.unwrap().status,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn singleton_insert_conflicts_while_live() {
        let store = Store::new();
        let first = ExecutionResult::new("local/a.A", "A", &queue(), None, "alice");
        let first_id = first.id;
        store.insert_result(first, Some("local/a.A")).await.unwrap();

        let second = ExecutionResult::new("local/a.A", "A", &queue(), None, "alice");
        let err = store
            .insert_result(second.clone(), Some("local/a.A"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobplaneError::Conflict(_)));

        store
            .transition_result(&first_id, ExecutionStatus::Failure, |_| {})
            .await
            .unwrap();
        store.insert_result(second, Some("local/a.A")).await.unwrap();
    }

    #[tokio::test]
    async fn queue_rebinding_blocked_by_live_execution() {
        let store = Store::new();
        store.put_queue(queue()).await.unwrap();
        let result = ExecutionResult::new("local/a.A", "A", &queue(), None, "alice");
        store.insert_result(result, None).await.unwrap();

        let rebound = ExecutionQueue {
            name: "default".into(),
            backend: QueueBackend::OrchestratorPod {
                namespace: "jobs".into(),
                image: "jobplane:latest".into(),
            },
        };
        assert!(store.put_queue(rebound).await.is_err());
    }

    #[tokio::test]
    async fn purge_drops_logs_with_result() {
        let store = Store::new();
        let result = ExecutionResult::new("local/a.A", "A", &queue(), None, "alice");
        let id = result.id;
        store.insert_result(result, None).await.unwrap();
        store
            .transition_result(&id, ExecutionStatus::Failure, |_| {})
            .await
            .unwrap();
        store
            .append_log(LogEntry {
                id: Uuid::new_v4(),
                execution_id: id,
                created_at: Utc::now(),
                severity: models::Severity::Error,
                message: "boom".into(),
                object_ref: None,
                grouping: None,
            })
            .await;

        let removed = store
            .purge_finished_before(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(removed, 1);
        assert!(store.logs(&id).await.is_empty());
    }
}
