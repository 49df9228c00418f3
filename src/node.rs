use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::approval::ApprovalGate;
use crate::config::{BrokerConfig, Config};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::jobs::registry::{JobRegistry, JobSource};
use crate::pod::{KubernetesOrchestrator, Orchestrator, PodExecutor};
use crate::runtime::Cancellations;
use crate::scheduler::Beat;
use crate::store::models::{BackendKind, QueueBackend};
use crate::store::retention::RetentionSweeper;
use crate::store::Store;
use crate::tracker::ExecutionTracker;
use crate::worker::{Broker, MemoryBroker, RedisBroker, WorkerPool};

/// How long running jobs and pod supervisors get to finish on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Main node that wires every component together.
pub struct Node {
    pub config: Config,
    pub store: Store,
    pub registry: Arc<JobRegistry>,
    pub tracker: ExecutionTracker,
    pub dispatcher: Arc<Dispatcher>,
    pub approvals: Arc<ApprovalGate>,
    pub worker_pool: Arc<WorkerPool>,
    pub pods: Option<Arc<PodExecutor>>,
    pub beat: Arc<Beat>,
    pub retention: Option<Arc<RetentionSweeper>>,
}

impl Node {
    /// Build a node with the backends named in `config`.
    pub async fn build(config: Config, sources: Vec<Arc<dyn JobSource>>) -> Result<Self> {
        config.validate()?;
        let broker: Arc<dyn Broker> = match &config.worker.broker {
            BrokerConfig::Memory => Arc::new(MemoryBroker::new()),
            BrokerConfig::Redis { url } => Arc::new(RedisBroker::new(url)?),
        };
        let needs_orchestrator = config
            .queue_configs()
            .iter()
            .any(|q| q.backend == BackendKind::OrchestratorPod);
        let orchestrator: Option<Arc<dyn Orchestrator>> = if needs_orchestrator {
            Some(Arc::new(KubernetesOrchestrator::new(&config.pod)?))
        } else {
            None
        };
        Self::with_backends(config, sources, broker, orchestrator).await
    }

    /// Build a node around explicit backends.
    pub async fn with_backends(
        config: Config,
        sources: Vec<Arc<dyn JobSource>>,
        broker: Arc<dyn Broker>,
        orchestrator: Option<Arc<dyn Orchestrator>>,
    ) -> Result<Self> {
        let store = Store::new();
        for queue in config.execution_queues() {
            store.put_queue(queue).await?;
        }

        let registry = Arc::new(JobRegistry::new(store.clone()));
        for source in sources {
            registry.add_source(source).await;
        }
        registry.refresh().await?;

        let tracker = ExecutionTracker::new(store.clone());
        let cancellations = Cancellations::new();
        let limits = config.defaults.time_limits();

        let pods = orchestrator.map(|orchestrator| {
            Arc::new(PodExecutor::new(
                orchestrator,
                tracker.clone(),
                cancellations.clone(),
                config.pod.clone(),
            ))
        });

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            tracker.clone(),
            broker.clone(),
            pods.clone(),
            cancellations.clone(),
            config.defaults.queue.clone(),
            limits,
        ));
        let approvals = Arc::new(ApprovalGate::new(dispatcher.clone()));

        let topics: Vec<String> = store
            .list_queues()
            .await
            .into_iter()
            .filter_map(|q| match q.backend {
                QueueBackend::WorkerPool { topic } => Some(topic),
                QueueBackend::OrchestratorPod { .. } => None,
            })
            .collect();
        let worker_pool = Arc::new(WorkerPool::new(
            registry.clone(),
            tracker.clone(),
            broker,
            cancellations,
            topics,
            config.worker.concurrency,
            limits,
        ));

        let beat = Arc::new(Beat::new(
            dispatcher.clone(),
            Duration::from_millis(config.scheduler.poll_interval_ms),
            config.scheduler.instance_id.clone(),
        ));

        let retention = config.defaults.retention().map(|max_age| {
            Arc::new(RetentionSweeper::new(
                store.clone(),
                max_age,
                Duration::from_secs(config.defaults.retention_sweep_secs),
            ))
        });

        Ok(Self {
            config,
            store,
            registry,
            tracker,
            dispatcher,
            approvals,
            worker_pool,
            pods,
            beat,
            retention,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            dispatcher: self.dispatcher.clone(),
            approvals: self.approvals.clone(),
            access: Arc::new(self.config.access.clone()),
            orphans: self
                .pods
                .as_ref()
                .map(|p| p.orphans().clone())
                .unwrap_or_default(),
            log_tail_lines: self.config.defaults.log_tail_lines,
        }
    }

    /// Run the node until `shutdown` fires.
    ///
    /// 1. Spawns the worker pool slots
    /// 2. Spawns the Beat (if enabled)
    /// 3. Spawns the retention sweeper (if configured)
    /// 4. Serves the HTTP API until shutdown
    /// 5. Drains in-flight jobs and pod supervisors
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let workers = self.worker_pool.clone().spawn(shutdown.clone());

        if let Some(retention) = &self.retention {
            let retention = retention.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { retention.run(token).await });
        }

        let beat_handle = if self.config.scheduler.enabled {
            let beat = self.beat.clone();
            let token = shutdown.clone();
            Some(tokio::spawn(async move { beat.run(token).await }))
        } else {
            tracing::info!("Beat disabled on this node");
            None
        };

        let served = run_api(self.config.server.listen_addr, self.api_state(), shutdown.clone()).await;
        if let Err(ref e) = served {
            tracing::error!(error = %e, "HTTP API stopped");
            shutdown.cancel();
        }

        tracing::info!("Draining workers and pod supervisors");
        let drained_workers =
            tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(workers)).await;
        if drained_workers.is_err() {
            tracing::warn!("Worker slots still busy after drain timeout");
        }
        if let Some(handle) = beat_handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Beat task ended abnormally");
            }
        }
        if let Some(pods) = &self.pods {
            if !pods.drain(DRAIN_TIMEOUT).await {
                tracing::warn!("Pod supervisors still running after drain timeout");
            }
        }
        tracing::info!("Node stopped");
        served
    }
}
