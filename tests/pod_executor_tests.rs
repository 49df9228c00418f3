
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use jobplane::dispatch::Submission;
use jobplane::error::{ErrorKind, JobplaneError};
use jobplane::jobs::job::LogRecord;
use jobplane::pod::manifest::{ENV_CLASS_PATH, ENV_EXECUTION_ID, ENV_HARD_LIMIT};
use jobplane::pod::runner::PodLine;
use jobplane::pod::{pod_name, PodPhase};
use jobplane::store::models::{ExecutionStatus, JobOverrides, Severity};
use test_harness::*;

fn line(pod_line: &PodLine) -> String {
    serde_json::to_string(pod_line).unwrap()
}

fn output(lines: &[PodLine], extra: &[&str]) -> String {
    let mut out: Vec<String> = lines.iter().map(line).collect();
    out.extend(extra.iter().map(|s| s.to_string()));
    out.join("\n")
}

async fn launch(t: &TestNode) -> (uuid::Uuid, String) {
    match t.node.dispatcher.submit(&admin(), run(POD_JOB)).await.unwrap() {
        Submission::Started(result) => (result.id, pod_name(&result.id)),
        Submission::Deferred(_) => panic!("expected an immediate run"),
    }
}

async fn wait_for_delete(t: &TestNode, pod: &str) {
    assert_eventually(
        || async { t.orchestrator.was_deleted(pod).await },
        Duration::from_secs(5),
        "execution pod was not deleted",
    )
    .await;
}

#[tokio::test]
async fn test_pod_run_succeeds_and_pod_is_deleted() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;

    let running = t.result(&id).await;
    assert_eq!(running.status, ExecutionStatus::Running);
    assert_eq!(running.handle.as_deref(), Some(pod.as_str()));
    assert!(t.orchestrator.exists(&pod).await);

    let logs = output(
        &[
            PodLine::Log(LogRecord::new(Severity::Info, "inside the pod")),
            PodLine::Result {
                payload: json!({ "rows": 3 }),
            },
        ],
        &["stray line from a library"],
    );
    t.orchestrator
        .finish(&pod, PodPhase::Succeeded, None, &logs)
        .await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.result, Some(json!({ "rows": 3 })));
    wait_for_delete(&t, &pod).await;

    let messages: Vec<String> = t.logs(&id).await.into_iter().map(|l| l.message).collect();
    let creating = format!("creating execution pod {}", pod);
    let reading = format!("reading execution pod {}", pod);
    let deleting = format!("deleting execution pod {}", pod);
    let position = |m: &str| messages.iter().position(|x| x == m).unwrap();
    assert!(position(&creating) < position(&reading));
    assert!(position(&reading) < position("inside the pod"));
    assert!(messages.contains(&"stray line from a library".to_string()));
    assert!(messages.contains(&deleting));
    assert!(t.node.api_state().orphans.list().await.is_empty());
}

#[tokio::test]
async fn test_manifest_carries_execution_identity() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;

    let created = t.orchestrator.created.lock().await.clone();
    assert_eq!(created.len(), 1);
    let manifest = &created[0];
    assert_eq!(manifest.metadata.name, pod);
    assert_eq!(manifest.spec.restart_policy, "Never");
    assert_eq!(manifest.spec.active_deadline_seconds, 10);

    let env = &manifest.spec.containers[0].env;
    let value = |name: &str| {
        env.iter()
            .find(|e| e.name == name)
            .map(|e| e.value.clone())
            .unwrap()
    };
    assert_eq!(value(ENV_EXECUTION_ID), id.to_string());
    assert_eq!(value(ENV_CLASS_PATH), POD_JOB);
    assert_eq!(value(ENV_HARD_LIMIT), "10");
}

#[tokio::test]
async fn test_pod_reported_error_becomes_failure() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;

    let logs = output(
        &[PodLine::Error {
            kind: ErrorKind::Runtime,
            summary: "device unreachable".to_string(),
            detail: Some("timeout after 30s".to_string()),
        }],
        &[],
    );
    t.orchestrator.finish(&pod, PodPhase::Failed, None, &logs).await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    assert_eq!(done.error_kind, Some(ErrorKind::Runtime));
    assert_eq!(done.error.as_deref(), Some("device unreachable"));
    wait_for_delete(&t, &pod).await;
}

#[tokio::test]
async fn test_pod_is_deleted_even_when_log_retrieval_fails() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;
    t.orchestrator.fail_logs.store(true, Ordering::SeqCst);

    t.orchestrator.finish(&pod, PodPhase::Failed, None, "").await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    wait_for_delete(&t, &pod).await;

    let logs = t.logs(&id).await;
    assert!(logs
        .iter()
        .any(|l| l.severity == Severity::Warning && l.message.contains("failed to retrieve logs")));
}

#[tokio::test]
async fn test_orchestrator_unreachable_at_launch() {
    let t = TestNode::new().await;
    t.orchestrator.unreachable.store(true, Ordering::SeqCst);

    let err = t
        .node
        .dispatcher
        .submit(&admin(), run(POD_JOB))
        .await
        .unwrap_err();
    assert!(matches!(err, JobplaneError::Dispatch(_)));

    let results = t.node.store.list_results(10).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Dispatch));
    assert_ne!(result.error_kind, Some(ErrorKind::Runtime));

    // Nothing was created, so nothing is deleted or supervised.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let logs = t.logs(&result.id).await;
    assert!(!logs.iter().any(|l| l.message.starts_with("deleting execution pod")));
    assert!(!logs.iter().any(|l| l.message.starts_with("reading execution pod")));
    assert!(t.orchestrator.deleted.lock().await.is_empty());
}

#[tokio::test]
async fn test_failed_delete_is_recorded_as_orphan() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;
    t.orchestrator.fail_delete.store(true, Ordering::SeqCst);

    let logs = output(&[PodLine::Result { payload: json!(1) }], &[]);
    t.orchestrator
        .finish(&pod, PodPhase::Succeeded, None, &logs)
        .await;

    let state = t.node.api_state();
    assert_eventually(
        || async { !state.orphans.list().await.is_empty() },
        Duration::from_secs(5),
        "orphan was not recorded",
    )
    .await;

    let orphans = state.orphans.list().await;
    assert_eq!(orphans[0].pod, pod);
    assert_eq!(orphans[0].execution_id, id);

    // Terminal status is untouched by the cleanup failure.
    let done = t.result(&id).await;
    assert_eq!(done.status, ExecutionStatus::Success);
    let logs = t.logs(&id).await;
    assert!(logs
        .iter()
        .any(|l| l.severity == Severity::Warning && l.message.contains("failed to delete")));
}

#[tokio::test]
async fn test_orchestrator_deadline_is_a_time_limit_failure() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;

    t.orchestrator
        .finish(&pod, PodPhase::Failed, Some("DeadlineExceeded"), "")
        .await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.error_kind, Some(ErrorKind::TimeLimit));
    wait_for_delete(&t, &pod).await;
}

#[tokio::test]
async fn test_supervisor_deadline_stops_a_stuck_pod() {
    let t = TestNode::new().await;
    t.node
        .store
        .set_job_overrides(
            POD_JOB,
            JobOverrides {
                soft_time_limit_secs: Some(1),
                hard_time_limit_secs: Some(1),
                ..JobOverrides::default()
            },
        )
        .await
        .unwrap();
    let (id, pod) = launch(&t).await;

    // The fake never moves the pod past Running.
    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    assert_eq!(done.error_kind, Some(ErrorKind::TimeLimit));
    wait_for_delete(&t, &pod).await;
}

#[tokio::test]
async fn test_cancel_deletes_running_pod() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;

    t.node.dispatcher.cancel(&admin(), &id).await.unwrap();

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.error_kind, Some(ErrorKind::Cancelled));
    wait_for_delete(&t, &pod).await;
}

#[tokio::test]
async fn test_repeated_status_errors_mark_backend_lost() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;
    t.orchestrator.fail_status.store(true, Ordering::SeqCst);

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    assert_eq!(done.error_kind, Some(ErrorKind::BackendLost));
    wait_for_delete(&t, &pod).await;
}

#[tokio::test]
async fn test_supervisor_panic_is_recorded_and_pod_deleted() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;
    t.orchestrator.panic_status.store(true, Ordering::SeqCst);

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    assert_eq!(done.error_kind, Some(ErrorKind::BackendLost));
    assert!(done.error.unwrap().contains("failed unexpectedly"));
    wait_for_delete(&t, &pod).await;
}

#[tokio::test]
async fn test_drain_waits_for_supervisors() {
    let t = TestNode::new().await;
    let (id, pod) = launch(&t).await;
    let pods = t.node.pods.clone().unwrap();

    let finisher = {
        let orchestrator = t.orchestrator.clone();
        let pod = pod.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator
                .finish(&pod, PodPhase::Succeeded, None, "")
                .await;
        })
    };

    assert!(pods.drain(Duration::from_secs(5)).await);
    finisher.await.unwrap();
    assert_eq!(t.status(&id).await, ExecutionStatus::Success);
    assert!(t.orchestrator.was_deleted(&pod).await);
}
