use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PodConfig;
use crate::error::JobplaneError;
use crate::pod::manifest::PodManifest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The API could not be reached at all.
    #[error("orchestrator unreachable: {0}")]
    Unavailable(String),

    #[error("pod not found: {0}")]
    NotFound(String),

    #[error("orchestrator API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl From<OrchestratorError> for JobplaneError {
    fn from(err: OrchestratorError) -> Self {
        JobplaneError::Orchestrator(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    /// e.g. `DeadlineExceeded` when the orchestrator enforced the deadline.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PodStatus {
    pub fn deadline_exceeded(&self) -> bool {
        self.reason.as_deref() == Some("DeadlineExceeded")
    }
}

/// The slice of the orchestrator API the pod executor needs.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<(), OrchestratorError>;

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, OrchestratorError>;

    /// Captured stdout/stderr of the pod's container.
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, OrchestratorError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Kubernetes core/v1 pods over plain REST.
pub struct KubernetesOrchestrator {
    api_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct PodObject {
    #[serde(default)]
    status: Option<PodStatusObject>,
}

#[derive(Deserialize)]
struct PodStatusObject {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_phase(phase: Option<&str>) -> PodPhase {
    match phase {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}

impl KubernetesOrchestrator {
    pub fn new(config: &PodConfig) -> Result<Self, JobplaneError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(token) = read_token(config.token_path.as_deref())? {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token).parse().map_err(|_| {
                    JobplaneError::Configuration("invalid orchestrator token".to_string())
                })?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder.build().map_err(|e| {
            JobplaneError::Configuration(format!("failed to build orchestrator client: {}", e))
        })?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_url, namespace)
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.pods_url(namespace), name)
    }

    async fn check(
        name: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, OrchestratorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        Err(OrchestratorError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// A missing token file is not an error; the API may not need one.
fn read_token(path: Option<&Path>) -> Result<Option<String>, JobplaneError> {
    match path {
        Some(path) if path.exists() => {
            let token = std::fs::read_to_string(path)?;
            Ok(Some(token.trim().to_string()))
        }
        _ => Ok(None),
    }
}

fn transport_error(e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Unavailable(e.to_string())
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<(), OrchestratorError> {
        let response = self
            .client
            .post(self.pods_url(&manifest.metadata.namespace))
            .json(manifest)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(&manifest.metadata.name, response).await?;
        Ok(())
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, OrchestratorError> {
        let response = self
            .client
            .get(self.pod_url(namespace, name))
            .send()
            .await
            .map_err(transport_error)?;
        let pod: PodObject = Self::check(name, response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        let status = pod.status.unwrap_or(PodStatusObject {
            phase: None,
            reason: None,
            message: None,
        });
        Ok(PodStatus {
            phase: parse_phase(status.phase.as_deref()),
            reason: status.reason,
            message: status.message,
        })
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, OrchestratorError> {
        let response = self
            .client
            .get(format!("{}/log", self.pod_url(namespace, name)))
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(name, response)
            .await?
            .text()
            .await
            .map_err(transport_error)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        let response = self
            .client
            .delete(self.pod_url(namespace, name))
            .query(&[("gracePeriodSeconds", "0")])
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(name, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn phases_parse() {
        assert_eq!(parse_phase(Some("Succeeded")), PodPhase::Succeeded);
        assert_eq!(parse_phase(Some("Failed")), PodPhase::Failed);
        assert_eq!(parse_phase(Some("Evicted")), PodPhase::Unknown);
        assert_eq!(parse_phase(None), PodPhase::Unknown);
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
    }

    #[test]
    fn urls_follow_core_v1_layout() {
        let mut config = PodConfig::default();
        config.api_url = "https://k8s.local:6443/".into();
        config.token_path = None;
        let k8s = KubernetesOrchestrator::new(&config).unwrap();
        assert_eq!(
            k8s.pod_url("batch", "jobplane-1"),
            "https://k8s.local:6443/api/v1/namespaces/batch/pods/jobplane-1"
        );
    }

    #[test]
    fn token_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "abc123").unwrap();
        assert_eq!(read_token(Some(file.path())).unwrap(), Some("abc123".into()));
        assert_eq!(read_token(Some(Path::new("/nonexistent/token"))).unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_api_is_unavailable() {
        let mut config = PodConfig::default();
        config.api_url = "http://127.0.0.1:9".into();
        config.token_path = None;
        let k8s = KubernetesOrchestrator::new(&config).unwrap();
        let err = k8s.pod_status("batch", "jobplane-1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Unavailable(_)));
    }

    #[test]
    fn deadline_reason_is_detected() {
        let status = PodStatus {
            phase: PodPhase::Failed,
            reason: Some("DeadlineExceeded".into()),
            message: None,
        };
        assert!(status.deadline_exceeded());
    }
}
