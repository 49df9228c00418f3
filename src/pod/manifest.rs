use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PodConfig;
use crate::error::Result;
use crate::jobs::job::JobArguments;
use crate::runtime::TimeLimits;

pub const ENV_CLASS_PATH: &str = "JOBPLANE_JOB_CLASS_PATH";
pub const ENV_EXECUTION_ID: &str = "JOBPLANE_EXECUTION_ID";
pub const ENV_ARGUMENTS: &str = "JOBPLANE_ARGUMENTS";
pub const ENV_API_URL: &str = "JOBPLANE_API_URL";
pub const ENV_BROKER_URL: &str = "JOBPLANE_BROKER_URL";
pub const ENV_SOFT_LIMIT: &str = "JOBPLANE_SOFT_TIME_LIMIT_SECS";
pub const ENV_HARD_LIMIT: &str = "JOBPLANE_HARD_TIME_LIMIT_SECS";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const EXECUTION_LABEL: &str = "jobplane.io/execution-id";

const CONTAINER_NAME: &str = "job";

/// Everything needed to start one execution pod.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub execution_id: Uuid,
    pub class_path: String,
    pub arguments: JobArguments,
    pub namespace: String,
    pub image: String,
    pub limits: TimeLimits,
}

/// Deterministic pod name for an execution.
pub fn pod_name(execution_id: &Uuid) -> String {
    format!("jobplane-{}", execution_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub restart_policy: String,
    /// Orchestrator-side hard limit; the pod is killed once it elapses.
    pub active_deadline_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    pub security_context: SecurityContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub allow_privilege_escalation: bool,
    pub read_only_root_filesystem: bool,
    pub run_as_non_root: bool,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub drop: Vec<String>,
}

/// Build the one-shot pod manifest for `spec`.
///
/// The container runs `jobplane pod-run`, which reads the execution from its
/// environment and runs the same job code path as a worker slot. Pod hardening:
/// - All capabilities dropped, no privilege escalation
/// - Read-only root filesystem, non-root user
/// - Memory and CPU limits
pub fn build_manifest(spec: &LaunchSpec, config: &PodConfig) -> Result<PodManifest> {
    let name = pod_name(&spec.execution_id);

    let mut env = vec![
        EnvVar::new(ENV_CLASS_PATH, spec.class_path.clone()),
        EnvVar::new(ENV_EXECUTION_ID, spec.execution_id.to_string()),
        EnvVar::new(ENV_ARGUMENTS, serde_json::to_string(&spec.arguments)?),
        EnvVar::new(ENV_SOFT_LIMIT, spec.limits.soft.as_secs().to_string()),
        EnvVar::new(ENV_HARD_LIMIT, spec.limits.hard.as_secs().to_string()),
    ];
    if let Some(ref url) = config.callback_url {
        env.push(EnvVar::new(ENV_API_URL, url.clone()));
    }
    if let Some(ref url) = config.broker_url {
        env.push(EnvVar::new(ENV_BROKER_URL, url.clone()));
    }

    let mut limits = BTreeMap::new();
    if let Some(ref memory) = config.memory_limit {
        limits.insert("memory".to_string(), memory.clone());
    }
    if let Some(ref cpu) = config.cpu_limit {
        limits.insert("cpu".to_string(), cpu.clone());
    }
    let resources = (!limits.is_empty()).then_some(ResourceRequirements { limits });

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), "jobplane".to_string());
    labels.insert(EXECUTION_LABEL.to_string(), spec.execution_id.to_string());

    Ok(PodManifest {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            name,
            namespace: spec.namespace.clone(),
            labels,
        },
        spec: PodSpec {
            restart_policy: "Never".to_string(),
            active_deadline_seconds: spec.limits.hard.as_secs().max(1),
            service_account_name: config.service_account.clone(),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: spec.image.clone(),
                args: vec!["pod-run".to_string()],
                env,
                resources,
                security_context: SecurityContext {
                    allow_privilege_escalation: false,
                    read_only_root_filesystem: true,
                    run_as_non_root: true,
                    capabilities: Capabilities {
                        drop: vec!["ALL".to_string()],
                    },
                },
            }],
        },
    })
}
