
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use jobplane::config::{Capability, Principal};
use jobplane::dispatch::{RunRequest, Schedule, Submission};
use jobplane::error::JobplaneError;
use jobplane::scheduler::{Beat, Recurrence};
use jobplane::store::models::{ApprovalState, ExecutionRequest, ExecutionStatus, JobOverrides};
use test_harness::*;

fn alice() -> Principal {
    Principal::new("alice", &[Capability::Run, Capability::View, Capability::Approve])
}

fn bob() -> Principal {
    Principal::new("bob", &[Capability::View, Capability::Approve])
}

async fn submit_gated(t: &TestNode, by: &Principal) -> ExecutionRequest {
    match t.node.dispatcher.submit(by, run(GATED)).await.unwrap() {
        Submission::Deferred(request) => request,
        Submission::Started(result) => panic!("gated job started right away: {}", result.id),
    }
}

fn beat(t: &TestNode) -> Beat {
    Beat::new(t.node.dispatcher.clone(), Duration::from_millis(20), "beat-test")
}

#[tokio::test]
async fn test_gated_request_waits_for_approval_then_dispatches() {
    let t = TestNode::new().await;
    let request = submit_gated(&t, &alice()).await;
    assert_eq!(request.approval, ApprovalState::PendingApproval);

    // The Beat never sees a pending request.
    let report = beat(&t).tick_once(Utc::now() + chrono::Duration::hours(1)).await;
    assert_eq!(report.due, 0);
    assert!(t.node.store.results_for_request(&request.id).await.is_empty());

    let outcome = t.node.approvals.approve(&bob(), &request.id).await.unwrap();
    assert_eq!(outcome.request.approval, ApprovalState::Approved);
    assert_eq!(outcome.request.approved_by.as_deref(), Some("bob"));
    assert!(outcome.request.approved_at.is_some());
    assert!(outcome.request.fired);

    let dispatched = outcome.dispatched.expect("due one-shot dispatched on approval");
    assert_eq!(dispatched.request_id, Some(request.id));
    assert_eq!(dispatched.principal, "alice");

    // Approval dispatched it; the Beat must not fire it again.
    let report = beat(&t).tick_once(Utc::now()).await;
    assert_eq!(report.dispatched, 0);
    assert_eq!(t.node.store.results_for_request(&request.id).await.len(), 1);

    t.start_workers();
    let done = t.wait_for_terminal(&dispatched.id).await;
    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.result, Some(json!({ "dryrun": false })));
}

#[tokio::test]
async fn test_denied_request_never_creates_an_execution() {
    let t = TestNode::new().await;
    let request = submit_gated(&t, &alice()).await;

    let denied = t.node.approvals.deny(&bob(), &request.id).await.unwrap();
    assert_eq!(denied.approval, ApprovalState::Denied);
    assert!(!denied.enabled);
    assert_eq!(denied.next_due_at, None);

    let report = beat(&t).tick_once(Utc::now() + chrono::Duration::days(30)).await;
    assert_eq!(report.due, 0);
    assert!(t.node.store.results_for_request(&request.id).await.is_empty());

    let late = t.node.approvals.approve(&bob(), &request.id).await;
    assert!(matches!(late, Err(JobplaneError::Conflict(_))));
    let redeny = t.node.approvals.deny(&bob(), &request.id).await;
    assert!(matches!(redeny, Err(JobplaneError::Conflict(_))));
    assert!(t.node.store.list_results(10).await.is_empty());
}

#[tokio::test]
async fn test_approval_of_disabled_job_keeps_request_pending() {
    let t = TestNode::new().await;
    let request = submit_gated(&t, &alice()).await;

    t.node
        .store
        .set_job_overrides(
            GATED,
            JobOverrides {
                enabled: Some(false),
                ..JobOverrides::default()
            },
        )
        .await
        .unwrap();

    let err = t.node.approvals.approve(&bob(), &request.id).await.unwrap_err();
    assert!(matches!(err, JobplaneError::JobDisabled(_)));

    let stored = t.node.store.get_request(&request.id).await.unwrap();
    assert_eq!(stored.approval, ApprovalState::PendingApproval);
    assert!(!stored.fired);
    assert_eq!(stored.total_run_count, 0);
    assert!(t.node.store.results_for_request(&request.id).await.is_empty());

    // Once the job is back the same request can still be approved and run.
    t.node
        .store
        .set_job_overrides(GATED, JobOverrides::default())
        .await
        .unwrap();
    let outcome = t.node.approvals.approve(&bob(), &request.id).await.unwrap();
    assert_eq!(outcome.request.approval, ApprovalState::Approved);
    assert!(outcome.dispatched.is_some());
    assert_eq!(t.node.store.results_for_request(&request.id).await.len(), 1);
}

#[tokio::test]
async fn test_self_approval_needs_approve_own() {
    let t = TestNode::new().await;
    let request = submit_gated(&t, &alice()).await;

    let err = t.node.approvals.approve(&alice(), &request.id).await.unwrap_err();
    assert!(matches!(err, JobplaneError::Forbidden(_)));

    let trusted = Principal::new(
        "alice",
        &[Capability::Run, Capability::Approve, Capability::ApproveOwn],
    );
    let outcome = t.node.approvals.approve(&trusted, &request.id).await.unwrap();
    assert_eq!(outcome.request.approval, ApprovalState::Approved);
}

#[tokio::test]
async fn test_approval_requires_capability() {
    let t = TestNode::new().await;
    let request = submit_gated(&t, &alice()).await;
    let viewer = Principal::new("carol", &[Capability::View]);

    let err = t.node.approvals.approve(&viewer, &request.id).await.unwrap_err();
    assert!(matches!(err, JobplaneError::Forbidden(_)));
    let err = t.node.approvals.deny(&viewer, &request.id).await.unwrap_err();
    assert!(matches!(err, JobplaneError::Forbidden(_)));

    let missing = t
        .node
        .approvals
        .approve(&bob(), &uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(missing, JobplaneError::NotFound(_)));
}

#[tokio::test]
async fn test_dry_run_bypasses_the_gate() {
    let t = TestNode::new().await;
    t.start_workers();

    let submission = t
        .node
        .dispatcher
        .submit(&alice(), run_with(GATED, json!({ "dryrun": true })))
        .await
        .unwrap();
    let result = match submission {
        Submission::Started(result) => result,
        Submission::Deferred(_) => panic!("dry run was gated"),
    };

    let done = t.wait_for_terminal(&result.id).await;
    assert_eq!(done.result, Some(json!({ "dryrun": true })));
    assert!(t.node.store.list_requests().await.is_empty());
}

#[tokio::test]
async fn test_approved_recurring_request_is_left_to_the_beat() {
    let t = TestNode::new().await;
    let start = Utc::now() + chrono::Duration::minutes(5);
    let submission = t
        .node
        .dispatcher
        .submit(
            &alice(),
            RunRequest {
                job_class_path: GATED.to_string(),
                schedule: Some(Schedule {
                    recurrence: Recurrence::Interval { every_secs: 600 },
                    start_time: Some(start),
                    time_zone: None,
                }),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap();
    let request = match submission {
        Submission::Deferred(request) => request,
        Submission::Started(_) => panic!("expected a stored request"),
    };

    let outcome = t.node.approvals.approve(&bob(), &request.id).await.unwrap();
    assert!(outcome.dispatched.is_none());

    let report = beat(&t).tick_once(start).await;
    assert_eq!(report.dispatched, 1);
    let stored = t.node.store.get_request(&request.id).await.unwrap();
    assert_eq!(stored.next_due_at, Some(start + chrono::Duration::minutes(10)));
}
