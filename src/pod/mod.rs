//! Orchestrator-pod backend: one ephemeral pod per execution.
//!
//! - [`manifest`]: pod manifest synthesis
//! - [`orchestrator`]: the orchestrator API boundary ([`KubernetesOrchestrator`])
//! - [`PodExecutor`]: launch, per-pod supervision, log capture, guaranteed cleanup
//! - [`runner`]: what runs inside the pod

pub mod executor;
pub mod manifest;
pub mod orchestrator;
pub mod runner;

pub use executor::{OrphanLedger, OrphanRecord, PodExecutor};
pub use manifest::{build_manifest, pod_name, LaunchSpec, PodManifest};
pub use orchestrator::{KubernetesOrchestrator, Orchestrator, OrchestratorError, PodPhase, PodStatus};
