
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use jobplane::error::{JobplaneError, Result};
use jobplane::jobs::job::{Job, JobArguments, JobContext, JobFailure, JobMeta};
use jobplane::jobs::registry::{JobRegistration, JobRegistry, JobSource, StaticSource};
use jobplane::jobs::schema::{InputSchema, Variable};
use jobplane::store::models::JobOverrides;
use jobplane::store::Store;
use serde_json::Value;
use test_harness::*;

/// Source whose catalogue can be emptied or broken between refreshes.
struct SwitchableSource {
    offering: AtomicBool,
    broken: AtomicBool,
}

impl SwitchableSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            offering: AtomicBool::new(true),
            broken: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl JobSource for SwitchableSource {
    fn name(&self) -> &str {
        "git"
    }

    async fn load(&self) -> Result<Vec<JobRegistration>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(JobplaneError::Configuration(
                "repository checkout failed".to_string(),
            ));
        }
        if !self.offering.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(vec![JobRegistration::new("git/audit.Backup", || Succeed)])
    }
}

/// Declares both a sensitive variable and an approval gate.
struct Contradictory;

#[async_trait]
impl Job for Contradictory {
    fn meta(&self) -> JobMeta {
        JobMeta::new("Contradictory").with_approval_required()
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().var(Variable::string("token").sensitive())
    }

    async fn run(&self, _ctx: &JobContext, _args: JobArguments) -> std::result::Result<Value, JobFailure> {
        Ok(Value::Null)
    }
}

async fn registry_with(sources: Vec<Arc<dyn JobSource>>) -> (Store, JobRegistry) {
    let store = Store::new();
    let registry = JobRegistry::new(store.clone());
    for source in sources {
        registry.add_source(source).await;
    }
    (store, registry)
}

#[tokio::test]
async fn test_refresh_reports_added_then_unchanged() {
    let (store, registry) = registry_with(vec![Arc::new(test_source())]).await;

    let first = registry.refresh().await.unwrap();
    assert!(first.added.contains(&SUCCEED.to_string()));
    assert!(first.updated.is_empty());
    assert!(first.rejected.is_empty());

    let second = registry.refresh().await.unwrap();
    assert!(second.added.is_empty());
    assert!(second.updated.is_empty());
    assert!(second.missing.is_empty());

    let record = store.get_job(SUCCEED).await.unwrap();
    assert_eq!(record.source, "test");
    assert_eq!(record.meta.name, "Succeed");
    assert!(registry.class_paths().await.contains(&SUCCEED.to_string()));
}

#[tokio::test]
async fn test_operator_overrides_survive_refresh() {
    let (store, registry) = registry_with(vec![Arc::new(test_source())]).await;
    registry.refresh().await.unwrap();

    store
        .set_job_overrides(
            SUCCEED,
            JobOverrides {
                enabled: Some(false),
                soft_time_limit_secs: Some(5),
                ..JobOverrides::default()
            },
        )
        .await
        .unwrap();
    registry.refresh().await.unwrap();

    let record = registry.lookup(SUCCEED).await.unwrap();
    assert!(!record.enabled());
    assert_eq!(record.overrides.soft_time_limit_secs, Some(5));
}

#[tokio::test]
async fn test_job_removed_from_source_is_flagged_missing() {
    let source = SwitchableSource::new();
    let (store, registry) = registry_with(vec![source.clone()]).await;
    registry.refresh().await.unwrap();
    assert!(registry.load_executable("git/audit.Backup").await.is_ok());

    source.offering.store(false, Ordering::SeqCst);
    let report = registry.refresh().await.unwrap();
    assert_eq!(report.missing, vec!["git/audit.Backup".to_string()]);

    // The record stays; only the code is gone.
    let record = store.get_job("git/audit.Backup").await.unwrap();
    assert!(record.missing);
    let err = registry.load_executable("git/audit.Backup").await.err().unwrap();
    assert!(matches!(err, JobplaneError::Load { .. }));

    source.offering.store(true, Ordering::SeqCst);
    let report = registry.refresh().await.unwrap();
    assert_eq!(report.updated, vec!["git/audit.Backup".to_string()]);
    assert!(!store.get_job("git/audit.Backup").await.unwrap().missing);
}

#[tokio::test]
async fn test_failed_source_keeps_previous_jobs() {
    let source = SwitchableSource::new();
    let (store, registry) = registry_with(vec![source.clone()]).await;
    registry.refresh().await.unwrap();

    source.broken.store(true, Ordering::SeqCst);
    let report = registry.refresh().await.unwrap();
    assert!(report.missing.is_empty());
    assert!(!store.get_job("git/audit.Backup").await.unwrap().missing);
    assert!(registry.load_executable("git/audit.Backup").await.is_ok());
}

#[tokio::test]
async fn test_sensitive_job_requiring_approval_is_rejected() {
    let source = StaticSource::new("local")
        .register("bad.Contradictory", || Contradictory)
        .register("ok.Succeed", || Succeed);
    let (store, registry) = registry_with(vec![Arc::new(source)]).await;

    let report = registry.refresh().await.unwrap();
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "local/bad.Contradictory");
    assert!(store.get_job("local/bad.Contradictory").await.is_none());
    assert!(store.get_job("local/ok.Succeed").await.is_some());
}

#[tokio::test]
async fn test_duplicate_class_path_keeps_first_registration() {
    let first = StaticSource::new("shared").register("jobs.Succeed", || Succeed);
    let second = StaticSource::new("shared").register("jobs.Succeed", || Raise);
    let (_store, registry) = registry_with(vec![Arc::new(first), Arc::new(second)]).await;

    let report = registry.refresh().await.unwrap();
    assert_eq!(report.added, vec!["shared/jobs.Succeed".to_string()]);
    assert_eq!(
        report.rejected,
        vec![(
            "shared/jobs.Succeed".to_string(),
            "duplicate class path".to_string()
        )]
    );

    let job = registry.load_executable("shared/jobs.Succeed").await.unwrap();
    assert_eq!(job.meta().name, "Succeed");
}

#[tokio::test]
async fn test_unknown_job_lookup_is_not_found() {
    let (_store, registry) = registry_with(vec![Arc::new(test_source())]).await;
    registry.refresh().await.unwrap();
    let err = registry.lookup("test/jobs.Nope").await.unwrap_err();
    assert!(matches!(err, JobplaneError::NotFound(_)));
}
