
use std::time::Duration;

use serde_json::json;

use jobplane::dispatch::Submission;
use jobplane::error::ErrorKind;
use jobplane::store::models::{ExecutionStatus, Severity};
use jobplane::worker::TaskMessage;
use test_harness::*;

async fn submit(t: &TestNode, request: jobplane::dispatch::RunRequest) -> uuid::Uuid {
    match t.node.dispatcher.submit(&admin(), request).await.unwrap() {
        Submission::Started(result) => result.id,
        Submission::Deferred(_) => panic!("expected an immediate run"),
    }
}

#[tokio::test]
async fn test_running_job_is_cancelled_cooperatively() {
    let t = TestNode::new().await;
    t.start_workers();
    let id = submit(&t, run(WAIT)).await;

    let store = t.node.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.get_result(&id).await.unwrap().status == ExecutionStatus::Running }
        },
        Duration::from_secs(5),
        "job never started",
    )
    .await;

    let signalled = t.node.dispatcher.cancel(&admin(), &id).await.unwrap();
    assert!(signalled.cancel_requested);

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    assert_eq!(done.error_kind, Some(ErrorKind::Cancelled));
}

#[tokio::test]
async fn test_hard_time_limit_fails_execution() {
    let t = TestNode::new().await;
    t.start_workers();
    let id = submit(&t, run(HANG)).await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Failure);
    assert_eq!(done.error_kind, Some(ErrorKind::TimeLimit));
    assert!(done.error.unwrap().contains("Time limit exceeded"));

    let logs = t.logs(&id).await;
    assert!(logs
        .iter()
        .any(|l| l.severity == Severity::Warning && l.message.contains("Soft time limit")));
}

#[tokio::test]
async fn test_soft_time_limit_lets_job_finish() {
    let t = TestNode::new().await;
    t.start_workers();
    let id = submit(&t, run(WRAP_UP)).await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.result, Some(json!("partial")));

    let logs = t.logs(&id).await;
    let soft = logs
        .iter()
        .position(|l| l.message.contains("Soft time limit"))
        .expect("soft limit warning");
    let wrap = logs
        .iter()
        .position(|l| l.message == "wrapping up early")
        .expect("job reacted");
    assert!(soft < wrap);
}

#[tokio::test]
async fn test_sensitive_values_are_redacted_from_logs() {
    let t = TestNode::new().await;
    t.start_workers();
    let id = submit(
        &t,
        run_with(SECRET, json!({ "username": "netops", "password": "hunter2" })),
    )
    .await;

    let done = t.wait_for_terminal(&id).await;
    assert_eq!(done.status, ExecutionStatus::Success);

    let logs = t.logs(&id).await;
    assert_eq!(logs.len(), 3);
    for entry in &logs {
        assert!(
            !entry.message.contains("hunter2"),
            "secret leaked into log: {}",
            entry.message
        );
        assert!(entry.message.contains("(redacted)"));
    }
    assert!(logs[0].message.contains("netops"));
}

#[tokio::test]
async fn test_task_for_unknown_execution_is_dropped() {
    let t = TestNode::new().await;
    let message = TaskMessage {
        execution_result_id: uuid::Uuid::new_v4(),
        job_class_path: SUCCEED.to_string(),
        arguments: Default::default(),
    };

    t.node
        .worker_pool
        .execute("worker-test", message)
        .await
        .unwrap();
    assert!(t.node.store.list_results(10).await.is_empty());
}

#[tokio::test]
async fn test_job_gone_from_registry_fails_at_load() {
    let t = TestNode::new().await;
    let id = submit(&t, run(SUCCEED)).await;
    let message = TaskMessage {
        execution_result_id: id,
        job_class_path: "test/jobs.Vanished".to_string(),
        arguments: Default::default(),
    };

    t.node.worker_pool.execute("worker-test", message).await.unwrap();

    let result = t.result(&id).await;
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
    assert_eq!(result.handle.as_deref(), Some("worker-test"));
}
