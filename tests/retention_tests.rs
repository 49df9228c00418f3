
use chrono::Utc;

use jobplane::dispatch::Submission;
use test_harness::*;

async fn started(t: &TestNode, class_path: &str) -> uuid::Uuid {
    match t.node.dispatcher.submit(&admin(), run(class_path)).await.unwrap() {
        Submission::Started(result) => result.id,
        Submission::Deferred(_) => panic!("expected an immediate run"),
    }
}

#[tokio::test]
async fn test_retention_is_off_by_default() {
    let t = TestNode::new().await;
    assert!(t.node.retention.is_none());
}

#[tokio::test]
async fn test_sweep_purges_only_old_finished_executions() {
    let mut config = test_config();
    config.defaults.retention_days = Some(1);
    let t = TestNode::with_config(config).await;
    let sweeper = t.node.retention.clone().expect("retention configured");

    t.start_workers();
    let finished = started(&t, SUCCEED).await;
    t.wait_for_terminal(&finished).await;
    assert!(!t.logs(&finished).await.is_empty());
    let running = started(&t, WAIT).await;

    // Too recent to purge.
    assert_eq!(sweeper.sweep_once(Utc::now()).await, 0);
    assert!(t.node.store.get_result(&finished).await.is_some());

    let later = Utc::now() + chrono::Duration::days(2);
    assert_eq!(sweeper.sweep_once(later).await, 1);
    assert!(t.node.store.get_result(&finished).await.is_none());
    assert!(t.node.store.logs(&finished).await.is_empty());
    assert!(t.node.store.get_result(&running).await.is_some());
}
