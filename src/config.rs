use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JobplaneError, Result};
use crate::runtime::TimeLimits;
use crate::store::models::{BackendKind, ExecutionQueue, QueueBackend};

/// Top-level configuration, loaded from TOML. Every section has defaults,
/// so an empty file describes a single-node setup with one worker-pool queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub defaults: DefaultsConfig,
    pub queues: Vec<QueueConfig>,
    pub worker: WorkerConfig,
    pub pod: PodConfig,
    pub scheduler: SchedulerConfig,
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
        }
    }
}

const MAX_RETENTION_DAYS: u64 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub queue: String,
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
    /// Number of log lines returned with an execution's summary.
    pub log_tail_lines: usize,
    /// Finished executions and their logs are purged after this many days.
    /// Unset keeps them forever.
    pub retention_days: Option<u64>,
    pub retention_sweep_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            soft_time_limit_secs: 300,
            hard_time_limit_secs: 600,
            log_tail_lines: 20,
            retention_days: None,
            retention_sweep_secs: 3600,
        }
    }
}

impl DefaultsConfig {
    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days
            .and_then(|days| chrono::Duration::try_days(days as i64))
    }

    pub fn time_limits(&self) -> TimeLimits {
        TimeLimits {
            soft: Duration::from_secs(self.soft_time_limit_secs),
            hard: Duration::from_secs(self.hard_time_limit_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub backend: BackendKind,
    /// Broker topic for worker-pool queues (defaults to the queue name).
    #[serde(default)]
    pub topic: Option<String>,
    /// Namespace for orchestrator-pod queues (defaults to `pod.namespace`).
    #[serde(default)]
    pub namespace: Option<String>,
    /// Image for orchestrator-pod queues (defaults to `pod.image`).
    #[serde(default)]
    pub image: Option<String>,
}

impl QueueConfig {
    pub fn worker_pool(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: BackendKind::WorkerPool,
            topic: None,
            namespace: None,
            image: None,
        }
    }

    pub fn orchestrator_pod(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: BackendKind::OrchestratorPod,
            topic: None,
            namespace: None,
            image: None,
        }
    }

    pub fn to_queue(&self, pod: &PodConfig) -> ExecutionQueue {
        let backend = match self.backend {
            BackendKind::WorkerPool => QueueBackend::WorkerPool {
                topic: self.topic.clone().unwrap_or_else(|| self.name.clone()),
            },
            BackendKind::OrchestratorPod => QueueBackend::OrchestratorPod {
                namespace: self
                    .namespace
                    .clone()
                    .unwrap_or_else(|| pod.namespace.clone()),
                image: self.image.clone().unwrap_or_else(|| pod.image.clone()),
            },
        };
        ExecutionQueue {
            name: self.name.clone(),
            backend,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BrokerConfig {
    /// In-process broker; messages do not survive a restart.
    Memory,
    Redis { url: String },
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker slots; each runs one job at a time.
    pub concurrency: usize,
    pub broker: BrokerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            broker: BrokerConfig::Memory,
        }
    }
}

/// Orchestrator connection and execution-pod settings.
///
/// Memory and CPU limits apply to every execution pod; capabilities are
/// always dropped and the root filesystem is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    /// Orchestrator API base URL, e.g. `https://kubernetes.default.svc`.
    pub api_url: String,
    /// File holding the bearer token for the orchestrator API.
    pub token_path: Option<PathBuf>,
    pub namespace: String,
    pub image: String,
    pub service_account: Option<String>,
    /// Memory limit (e.g., "256Mi")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "500m" for half a CPU)
    pub cpu_limit: Option<String>,
    pub poll_interval_ms: u64,
    /// Consecutive failed status reads before the execution is given up.
    pub max_poll_failures: u32,
    pub max_backoff_ms: u64,
    /// Passed to the pod so it can reach this control plane.
    pub callback_url: Option<String>,
    /// Passed to the pod so it can reach the shared broker.
    pub broker_url: Option<String>,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            namespace: "jobplane".to_string(),
            image: "jobplane:latest".to_string(),
            service_account: None,
            memory_limit: Some("256Mi".to_string()),
            cpu_limit: Some("500m".to_string()),
            poll_interval_ms: 2000,
            max_poll_failures: 5,
            max_backoff_ms: 30_000,
            callback_url: None,
            broker_url: None,
        }
    }
}

impl PodConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Identifies this Beat instance in logs.
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            instance_id: "beat-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Run,
    View,
    Approve,
    /// Approve requests one submitted oneself.
    ApproveOwn,
    ManageJobs,
}

/// Capability assignments. The host application owns authentication; this
/// only maps an already-authenticated principal to what it may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub default_capabilities: Vec<Capability>,
    pub principals: HashMap<String, Vec<Capability>>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            default_capabilities: vec![
                Capability::Run,
                Capability::View,
                Capability::Approve,
                Capability::ManageJobs,
            ],
            principals: HashMap::new(),
        }
    }
}

impl AccessConfig {
    pub fn capabilities_for(&self, principal: &str) -> HashSet<Capability> {
        self.principals
            .get(principal)
            .unwrap_or(&self.default_capabilities)
            .iter()
            .copied()
            .collect()
    }

    pub fn principal(&self, name: &str) -> Principal {
        Principal {
            name: name.to_string(),
            capabilities: self.capabilities_for(name),
        }
    }
}

/// An authenticated caller and what it may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub capabilities: HashSet<Capability>,
}

impl Principal {
    pub fn new(name: impl Into<String>, capabilities: &[Capability]) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.iter().copied().collect(),
        }
    }

    /// Holds every capability; used by the scheduler and tests.
    pub fn system() -> Self {
        Self::new(
            "system",
            &[
                Capability::Run,
                Capability::View,
                Capability::Approve,
                Capability::ApproveOwn,
                Capability::ManageJobs,
            ],
        )
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(JobplaneError::Forbidden(format!(
                "{} lacks the {:?} capability",
                self.name, capability
            )))
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)
            .map_err(|e| JobplaneError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Declared queues, or a single worker-pool queue named after the default.
    pub fn queue_configs(&self) -> Vec<QueueConfig> {
        if self.queues.is_empty() {
            vec![QueueConfig::worker_pool(&self.defaults.queue)]
        } else {
            self.queues.clone()
        }
    }

    pub fn execution_queues(&self) -> Vec<ExecutionQueue> {
        self.queue_configs()
            .iter()
            .map(|q| q.to_queue(&self.pod))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let queues = self.queue_configs();
        let mut names = HashSet::new();
        for q in &queues {
            if q.name.is_empty() {
                return Err(JobplaneError::Configuration(
                    "queue name must not be empty".to_string(),
                ));
            }
            if !names.insert(q.name.as_str()) {
                return Err(JobplaneError::Configuration(format!(
                    "duplicate queue {}",
                    q.name
                )));
            }
            if q.backend == BackendKind::OrchestratorPod
                && q.image.as_deref().unwrap_or(&self.pod.image).is_empty()
            {
                return Err(JobplaneError::Configuration(format!(
                    "orchestrator-pod queue {} has no image",
                    q.name
                )));
            }
            if q.backend == BackendKind::WorkerPool && (q.namespace.is_some() || q.image.is_some())
            {
                return Err(JobplaneError::Configuration(format!(
                    "worker-pool queue {} cannot set pod namespace or image",
                    q.name
                )));
            }
        }
        if !names.contains(self.defaults.queue.as_str()) {
            return Err(JobplaneError::Configuration(format!(
                "default queue {} is not declared",
                self.defaults.queue
            )));
        }
        if self.defaults.hard_time_limit_secs < self.defaults.soft_time_limit_secs {
            return Err(JobplaneError::Configuration(
                "hard time limit must not be lower than the soft time limit".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(JobplaneError::Configuration(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(days) = self.defaults.retention_days {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(JobplaneError::Configuration(format!(
                    "retention_days must be between 1 and {}",
                    MAX_RETENTION_DAYS
                )));
            }
            if self.defaults.retention_sweep_secs == 0 {
                return Err(JobplaneError::Configuration(
                    "retention_sweep_secs must be positive".to_string(),
                ));
            }
        }
        if self.pod.poll_interval_ms == 0 || self.scheduler.poll_interval_ms == 0 {
            return Err(JobplaneError::Configuration(
                "poll intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
