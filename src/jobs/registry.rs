use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::{JobplaneError, Result};
use crate::jobs::job::Job;
use crate::store::models::JobRecord;
use crate::store::{Store, Upsert};

pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// A job class offered by a source, keyed by its stable class path.
#[derive(Clone)]
pub struct JobRegistration {
    pub class_path: String,
    factory: JobFactory,
}

impl JobRegistration {
    pub fn new<J, F>(class_path: impl Into<String>, factory: F) -> Self
    where
        J: Job + 'static,
        F: Fn() -> J + Send + Sync + 'static,
    {
        Self {
            class_path: class_path.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Job>),
        }
    }

    pub fn instantiate(&self) -> Box<dyn Job> {
        (self.factory)()
    }
}

impl std::fmt::Debug for JobRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistration")
            .field("class_path", &self.class_path)
            .finish()
    }
}

/// Somewhere jobs come from: a local path, a version-controlled
/// repository, or an installed extension.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Vec<JobRegistration>>;
}

/// Source backed by explicit registration calls.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    jobs: Vec<JobRegistration>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
        }
    }

    /// Register a job as `<source>/<path>`, e.g. `local/audit.DeviceAudit`.
    pub fn register<J, F>(mut self, path: &str, factory: F) -> Self
    where
        J: Job + 'static,
        F: Fn() -> J + Send + Sync + 'static,
    {
        let class_path = format!("{}/{}", self.name, path);
        self.jobs.push(JobRegistration::new(class_path, factory));
        self
    }
}

#[async_trait]
impl JobSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Vec<JobRegistration>> {
        Ok(self.jobs.clone())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub missing: Vec<String>,
    /// `(class_path, reason)` for jobs that could not be registered.
    pub rejected: Vec<(String, String)>,
}

/// Process-wide catalogue of job classes.
///
/// Lookups read the factory map concurrently; `refresh` is the only
/// writer and is serialized by its own lock.
pub struct JobRegistry {
    store: Store,
    sources: RwLock<Vec<Arc<dyn JobSource>>>,
    factories: RwLock<HashMap<String, JobRegistration>>,
    refresh_lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sources: RwLock::new(Vec::new()),
            factories: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn add_source(&self, source: Arc<dyn JobSource>) {
        tracing::info!(source = source.name(), "Job source added");
        self.sources.write().await.push(source);
    }

    /// Rescan every source and upsert job records.
    ///
    /// Operator overrides survive. Jobs no longer offered by any source are
    /// flagged missing, never deleted. If a source fails to load, the jobs
    /// it previously offered are left as they were.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let _guard = self.refresh_lock.lock().await;
        let sources: Vec<Arc<dyn JobSource>> = self.sources.read().await.clone();

        let mut report = RefreshReport::default();
        let mut factories: HashMap<String, JobRegistration> = HashMap::new();
        let mut present: HashSet<String> = HashSet::new();
        let mut failed_sources: HashSet<String> = HashSet::new();

        for source in &sources {
            let registrations = match source.load().await {
                Ok(regs) => regs,
                Err(e) => {
                    tracing::error!(source = source.name(), error = %e, "Failed to load job source");
                    failed_sources.insert(source.name().to_string());
                    continue;
                }
            };

            for registration in registrations {
                let class_path = registration.class_path.clone();
                if factories.contains_key(&class_path) {
                    report
                        .rejected
                        .push((class_path, "duplicate class path".to_string()));
                    continue;
                }

                let job = registration.instantiate();
                let mut meta = job.meta();
                let mut schema = job.input_schema();
                if meta.supports_dryrun {
                    schema = schema.with_dryrun(meta.dryrun_default);
                }
                if !schema.sensitive_names().is_empty() {
                    meta.has_sensitive_variables = true;
                }
                if meta.has_sensitive_variables && meta.approval_required {
                    tracing::error!(
                        class_path = %class_path,
                        "Job declares sensitive variables and requires approval; not registered"
                    );
                    report.rejected.push((
                        class_path,
                        "has_sensitive_variables cannot be combined with approval_required"
                            .to_string(),
                    ));
                    continue;
                }

                match self
                    .store
                    .upsert_job(&class_path, source.name(), meta, schema)
                    .await
                {
                    Upsert::Added => report.added.push(class_path.clone()),
                    Upsert::Updated => report.updated.push(class_path.clone()),
                    Upsert::Unchanged => {}
                }
                present.insert(class_path.clone());
                factories.insert(class_path, registration);
            }
        }

        // Keep whatever a failed source offered last time.
        if !failed_sources.is_empty() {
            let previous = self.factories.read().await;
            for (class_path, registration) in previous.iter() {
                if let Some(record) = self.store.get_job(class_path).await {
                    if failed_sources.contains(&record.source) && !present.contains(class_path) {
                        present.insert(class_path.clone());
                        factories.insert(class_path.clone(), registration.clone());
                    }
                }
            }
        }

        *self.factories.write().await = factories;
        report.missing = self.store.mark_missing_jobs(&present).await;

        tracing::info!(
            added = report.added.len(),
            updated = report.updated.len(),
            missing = report.missing.len(),
            rejected = report.rejected.len(),
            "Job registry refreshed"
        );
        Ok(report)
    }

    pub async fn lookup(&self, class_path: &str) -> Result<JobRecord> {
        self.store
            .get_job(class_path)
            .await
            .ok_or_else(|| JobplaneError::NotFound(format!("job {}", class_path)))
    }

    /// Fresh instance of the job's code. Instances are not cached; each
    /// execution gets its own.
    pub async fn load_executable(&self, class_path: &str) -> Result<Box<dyn Job>> {
        let factories = self.factories.read().await;
        let registration = factories.get(class_path).ok_or_else(|| JobplaneError::Load {
            class_path: class_path.to_string(),
            reason: "not offered by any job source".to_string(),
        })?;
        Ok(registration.instantiate())
    }

    pub async fn class_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.factories.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}
