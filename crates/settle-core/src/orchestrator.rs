//! The orchestrator boundary: readiness, workload submission, deployment wait.
//!
//! Scenarios only ever talk to the orchestrator through the [`Orchestrator`]
//! capability, so they can run against fakes. [`MarathonClient`] implements it
//! over Marathon's REST API.

use crate::poller::Poller;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Identifier the orchestrator assigns to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub String);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The HTTP client could not be constructed.
    #[error("failed to build orchestrator client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request produced no response.
    #[error("orchestrator request {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The orchestrator answered with an unexpected status.
    #[error("orchestrator returned {status} for {endpoint}: {body}")]
    UnexpectedStatus {
        endpoint: String,
        status: StatusCode,
        body: String,
    },

    /// The response body did not have the expected shape.
    #[error("malformed orchestrator response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The deployment is still listed as in progress.
    #[error("deployment {0} still in progress")]
    DeploymentPending(DeploymentId),

    /// The deployment did not finish in time; `last` is the last observed cause.
    #[error("deployment {id} did not complete within {timeout:?}: {last}")]
    DeploymentTimedOut {
        id: DeploymentId,
        timeout: Duration,
        last: String,
    },
}

/// Docker container settings of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSpec {
    pub image: String,
    pub network: String,
}

/// Container section of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub docker: DockerSpec,
}

/// A unit of application placement, shaped like a Marathon app definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub id: String,
    pub cpus: f64,
    pub mem: f64,
    pub instances: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
}

impl WorkloadSpec {
    /// A single-instance Docker workload on a bridged network.
    pub fn docker(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cpus: 0.1,
            mem: 32.0,
            instances: 1,
            labels: BTreeMap::new(),
            container: Some(ContainerSpec {
                kind: "DOCKER".to_string(),
                docker: DockerSpec {
                    image: image.into(),
                    network: "BRIDGE".to_string(),
                },
            }),
        }
    }

    /// Sets the CPU share.
    pub fn cpus(mut self, cpus: f64) -> Self {
        self.cpus = cpus;
        self
    }

    /// Sets memory in MiB.
    pub fn mem(mut self, mem: f64) -> Self {
        self.mem = mem;
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The id without leading/trailing slashes, as used in URL paths.
    pub fn path_id(&self) -> &str {
        self.id.trim_matches('/')
    }
}

/// What the harness needs from an orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// One readiness check. Callers poll this; it does not retry.
    async fn ping(&self) -> Result<(), OrchestratorError>;

    /// Submits (creates or updates) a workload and returns the deployment it started.
    async fn submit_workload(&self, spec: &WorkloadSpec) -> Result<DeploymentId, OrchestratorError>;

    /// Waits until the deployment completes or `timeout` elapses.
    async fn await_deployment(
        &self,
        id: &DeploymentId,
        timeout: Duration,
    ) -> Result<(), OrchestratorError>;
}

/// Builds orchestrator clients once the orchestrator's address is known.
pub trait OrchestratorFactory: Send + Sync {
    fn connect(&self, base_url: &str) -> Result<Arc<dyn Orchestrator>, OrchestratorError>;
}

/// [`Orchestrator`] over Marathon's REST API.
#[derive(Debug, Clone)]
pub struct MarathonClient {
    client: Client,
    base_url: String,
    poller: Poller,
}

#[derive(Deserialize)]
struct DeploymentRef {
    #[serde(rename = "deploymentId")]
    deployment_id: String,
}

#[derive(Deserialize)]
struct DeploymentInfo {
    id: String,
}

impl MarathonClient {
    /// Creates a client for the Marathon instance at `base_url`.
    ///
    /// `poller` drives [`await_deployment`](Orchestrator::await_deployment);
    /// `request_timeout` bounds every individual request.
    pub fn new(
        base_url: impl Into<String>,
        poller: Poller,
        request_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(OrchestratorError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poller,
        })
    }

    /// Base URL requests are made against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, OrchestratorError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(OrchestratorError::UnexpectedStatus {
            endpoint: endpoint.to_string(),
            status,
            body,
        })
    }

    /// One look at the deployment list; `Ok` once `id` is no longer in it.
    async fn deployment_finished(&self, id: &DeploymentId) -> Result<(), OrchestratorError> {
        let endpoint = self.endpoint("/v2/deployments");
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| OrchestratorError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
        let response = Self::check_status(&endpoint, response).await?;
        let deployments: Vec<DeploymentInfo> =
            response
                .json()
                .await
                .map_err(|source| OrchestratorError::Decode {
                    endpoint: endpoint.clone(),
                    source,
                })?;

        if deployments.iter().any(|d| d.id == id.0) {
            Err(OrchestratorError::DeploymentPending(id.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Orchestrator for MarathonClient {
    async fn ping(&self) -> Result<(), OrchestratorError> {
        let endpoint = self.endpoint("/ping");
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| OrchestratorError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
        Self::check_status(&endpoint, response).await?;
        Ok(())
    }

    async fn submit_workload(
        &self,
        spec: &WorkloadSpec,
    ) -> Result<DeploymentId, OrchestratorError> {
        let endpoint = self.endpoint(&format!("/v2/apps/{}", spec.path_id()));
        info!(workload = %spec.id, "submitting workload");

        let response = self
            .client
            .put(&endpoint)
            .query(&[("force", "false")])
            .json(spec)
            .send()
            .await
            .map_err(|source| OrchestratorError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
        let response = Self::check_status(&endpoint, response).await?;
        let deployment: DeploymentRef =
            response
                .json()
                .await
                .map_err(|source| OrchestratorError::Decode {
                    endpoint: endpoint.clone(),
                    source,
                })?;

        debug!(deployment = %deployment.deployment_id, "workload accepted");
        Ok(DeploymentId(deployment.deployment_id))
    }

    async fn await_deployment(
        &self,
        id: &DeploymentId,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        info!(deployment = %id, ?timeout, "waiting for deployment");
        self.poller
            .execute(|| self.deployment_finished(id), timeout)
            .await
            .map_err(|err| OrchestratorError::DeploymentTimedOut {
                id: id.clone(),
                timeout,
                last: err.to_string(),
            })
    }
}

/// Connects [`MarathonClient`]s with shared polling settings.
#[derive(Debug, Clone, Copy)]
pub struct MarathonConnector {
    poller: Poller,
    request_timeout: Duration,
}

impl MarathonConnector {
    pub fn new(poller: Poller, request_timeout: Duration) -> Self {
        Self {
            poller,
            request_timeout,
        }
    }
}

impl OrchestratorFactory for MarathonConnector {
    fn connect(&self, base_url: &str) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        Ok(Arc::new(MarathonClient::new(
            base_url,
            self.poller,
            self.request_timeout,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeMarathon {
        submitted: Mutex<Vec<(String, serde_json::Value)>>,
        deployment_polls: AtomicUsize,
        pending_polls: usize,
        ping_status: u16,
    }

    async fn serve(state: Arc<FakeMarathon>) -> SocketAddr {
        let app = Router::new()
            .route(
                "/ping",
                get(|State(s): State<Arc<FakeMarathon>>| async move {
                    (StatusCode::from_u16(s.ping_status).unwrap(), "pong")
                }),
            )
            .route(
                "/v2/apps/{*id}",
                put(
                    |State(s): State<Arc<FakeMarathon>>,
                     Path(id): Path<String>,
                     Json(body): Json<serde_json::Value>| async move {
                        s.submitted.lock().unwrap().push((id, body));
                        Json(serde_json::json!({"deploymentId": "dep-1", "version": "2017-01-01"}))
                    },
                ),
            )
            .route(
                "/v2/deployments",
                get(|State(s): State<Arc<FakeMarathon>>| async move {
                    let n = s.deployment_polls.fetch_add(1, Ordering::SeqCst);
                    if n < s.pending_polls {
                        Json(serde_json::json!([{"id": "dep-1"}, {"id": "other"}]))
                    } else {
                        Json(serde_json::json!([{"id": "other"}]))
                    }
                }),
            )
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr) -> MarathonClient {
        MarathonClient::new(
            format!("http://{addr}/"),
            Poller::new(Duration::from_millis(20)),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ping_ok_and_unavailable() {
        let ok = serve(Arc::new(FakeMarathon {
            ping_status: 200,
            ..Default::default()
        }))
        .await;
        assert!(client(ok).ping().await.is_ok());

        let down = serve(Arc::new(FakeMarathon {
            ping_status: 503,
            ..Default::default()
        }))
        .await;
        let err = client(down).ping().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::UnexpectedStatus { status, .. }
                if status == StatusCode::SERVICE_UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn test_submit_workload_puts_app_definition() {
        let state = Arc::new(FakeMarathon {
            ping_status: 200,
            ..Default::default()
        });
        let addr = serve(state.clone()).await;
        let spec = WorkloadSpec::docker("/whoami", "emilevauge/whoami")
            .cpus(0.1)
            .mem(32.0)
            .label("traefik.frontend.rule", "PathPrefix:/service")
            .label("traefik.port", "80");

        let id = client(addr).submit_workload(&spec).await.unwrap();
        assert_eq!(id, DeploymentId("dep-1".to_string()));

        let submitted = state.submitted.lock().unwrap();
        let (path_id, body) = &submitted[0];
        assert_eq!(path_id, "whoami");
        assert_eq!(body["id"], "/whoami");
        assert_eq!(body["container"]["type"], "DOCKER");
        assert_eq!(body["container"]["docker"]["network"], "BRIDGE");
        assert_eq!(body["container"]["docker"]["image"], "emilevauge/whoami");
        assert_eq!(body["labels"]["traefik.port"], "80");
    }

    #[tokio::test]
    async fn test_await_deployment_polls_until_gone() {
        let state = Arc::new(FakeMarathon {
            ping_status: 200,
            pending_polls: 3,
            ..Default::default()
        });
        let addr = serve(state.clone()).await;

        client(addr)
            .await_deployment(&DeploymentId("dep-1".to_string()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(state.deployment_polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_await_deployment_timeout_keeps_cause() {
        let state = Arc::new(FakeMarathon {
            ping_status: 200,
            pending_polls: usize::MAX,
            ..Default::default()
        });
        let addr = serve(state).await;

        let err = client(addr)
            .await_deployment(&DeploymentId("dep-1".to_string()), Duration::from_millis(150))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::DeploymentTimedOut { id, last, .. } => {
                assert_eq!(id.0, "dep-1");
                assert!(last.contains("deployment dep-1 still in progress"), "{last}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connector_builds_client_for_address() {
        let addr = serve(Arc::new(FakeMarathon {
            ping_status: 200,
            ..Default::default()
        }))
        .await;
        let connector = MarathonConnector::new(Poller::default(), Duration::from_secs(1));

        let orchestrator = connector.connect(&format!("http://{addr}")).unwrap();
        assert!(orchestrator.ping().await.is_ok());
    }

    #[test]
    fn test_workload_serialization_skips_empty_labels() {
        let json = serde_json::to_value(WorkloadSpec::docker("/a", "img")).unwrap();
        assert!(json.get("labels").is_none());
        assert_eq!(json["instances"], 1);
        assert_eq!(WorkloadSpec::docker("/team/a/", "img").path_id(), "team/a");
    }
}
