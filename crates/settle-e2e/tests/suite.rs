//! Runs the full suite against in-process stand-ins: a fake container engine,
//! a fake orchestrator, a local HTTP server playing the proxy entrypoint and a
//! shell process playing the proxy. The shell proxy appends to a heartbeat file
//! while it runs, so a test can tell whether it was stopped.
#![cfg(unix)]

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use reqwest::StatusCode as ReqwestStatus;
use settle_core::{
    ComposeProject, ContainerDetails, ContainerEngine, DeploymentId, DiagnosticReporter,
    EnvironmentController, EnvironmentError, HarnessConfig, NetworkAttachment, Orchestrator,
    OrchestratorError, OrchestratorFactory, OutputBuffer, WorkloadSpec,
};
use settle_e2e::{
    DeploymentScenario, Harness, RunConfig, RunResults, TestRunner, TestScenario, all_scenarios,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct FakeEngine {
    calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn up(&self, _project: &ComposeProject) -> Result<(), EnvironmentError> {
        self.calls.lock().unwrap().push("up");
        Ok(())
    }

    async fn down(&self, _project: &ComposeProject) -> Result<(), EnvironmentError> {
        self.calls.lock().unwrap().push("down");
        Ok(())
    }

    async fn containers(
        &self,
        _project: &ComposeProject,
        service: &str,
    ) -> Result<Vec<ContainerDetails>, EnvironmentError> {
        Ok(vec![ContainerDetails {
            id: format!("{service}-1"),
            networks: vec![NetworkAttachment {
                network: "bridge".to_string(),
                ip_address: "127.0.0.1".to_string(),
            }],
        }])
    }
}

/// Shared state of the fake orchestrator and the proxy stand-in.
#[derive(Default)]
struct Cluster {
    /// Whether ping ever succeeds.
    ready: bool,
    /// Whether a completed deployment becomes routable.
    routes_deployments: bool,
    /// Whether workload submission is refused.
    rejects_submissions: bool,
    /// Whether deployments never complete.
    stalls_deployments: bool,
    pings: AtomicUsize,
    routed: AtomicBool,
    connected: Mutex<Vec<String>>,
    submitted: Mutex<Vec<WorkloadSpec>>,
}

struct FakeOrchestrator {
    cluster: Arc<Cluster>,
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn ping(&self) -> Result<(), OrchestratorError> {
        let n = self.cluster.pings.fetch_add(1, Ordering::SeqCst);
        // Not listening on the first attempt, like a freshly started container.
        if self.cluster.ready && n > 0 {
            Ok(())
        } else {
            Err(OrchestratorError::UnexpectedStatus {
                endpoint: "/ping".to_string(),
                status: ReqwestStatus::SERVICE_UNAVAILABLE,
                body: "leader election in progress".to_string(),
            })
        }
    }

    async fn submit_workload(
        &self,
        spec: &WorkloadSpec,
    ) -> Result<DeploymentId, OrchestratorError> {
        if self.cluster.rejects_submissions {
            return Err(OrchestratorError::UnexpectedStatus {
                endpoint: format!("/v2/apps{}", spec.id),
                status: ReqwestStatus::CONFLICT,
                body: "app is locked by one or more deployments".to_string(),
            });
        }
        self.cluster.submitted.lock().unwrap().push(spec.clone());
        Ok(DeploymentId("dep-1".to_string()))
    }

    async fn await_deployment(
        &self,
        _id: &DeploymentId,
        _timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        if self.cluster.stalls_deployments {
            std::future::pending::<()>().await;
        }
        if self.cluster.routes_deployments {
            self.cluster.routed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct FakeConnector {
    cluster: Arc<Cluster>,
}

impl OrchestratorFactory for FakeConnector {
    fn connect(&self, base_url: &str) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        self.cluster
            .connected
            .lock()
            .unwrap()
            .push(base_url.to_string());
        Ok(Arc::new(FakeOrchestrator {
            cluster: self.cluster.clone(),
        }))
    }
}

async fn proxy_entrypoint(State(cluster): State<Arc<Cluster>>, uri: Uri) -> StatusCode {
    if uri.path().starts_with("/service") && cluster.routed.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Shell stand-in for the proxy: logs its config flag, appends to `heartbeat`
/// until stopped and says goodbye on SIGTERM.
fn proxy_script(heartbeat: &Path) -> String {
    format!(
        "trap 'echo \"proxy shutting down\"; exit 0' TERM; \
         echo \"proxy loaded $1\"; \
         while true; do echo tick >> '{}'; sleep 0.05; done",
        heartbeat.display()
    )
}

/// Everything a run needs, before it is handed to a [`TestRunner`].
struct Parts {
    dir: tempfile::TempDir,
    controller: EnvironmentController,
    harness: Harness,
    engine: Arc<FakeEngine>,
    cluster: Arc<Cluster>,
    diagnostics: OutputBuffer,
    heartbeat: PathBuf,
}

async fn parts(cluster: Cluster, tune: impl FnOnce(&mut HarnessConfig)) -> Parts {
    let cluster = Arc::new(cluster);

    let app = Router::new()
        .fallback(proxy_entrypoint)
        .with_state(cluster.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marathon.yml"), "services: {}\n").unwrap();
    let template = dir.path().join("simple.toml");
    std::fs::write(&template, "[marathon]\nendpoint = \"{{.MarathonURL}}\"\n").unwrap();
    let heartbeat = dir.path().join("heartbeat");

    let mut config = HarnessConfig::default();
    config.environment.compose_dir = dir.path().to_path_buf();
    config.proxy.binary = "sh".to_string();
    config.proxy.args = vec![
        "-c".to_string(),
        proxy_script(&heartbeat),
        "proxy".to_string(),
    ];
    config.proxy.config_template = template;
    config.proxy.entrypoint = format!("http://{addr}");
    config.polling.interval_ms = 20;
    config.polling.request_timeout_ms = 500;
    tune(&mut config);

    let engine = Arc::new(FakeEngine::default());
    let controller = EnvironmentController::new(engine.clone(), dir.path());
    let diagnostics = OutputBuffer::new();
    let harness = Harness::new(config)
        .with_orchestrators(Arc::new(FakeConnector {
            cluster: cluster.clone(),
        }))
        .with_diagnostics(DiagnosticReporter::new(diagnostics.clone()));

    Parts {
        dir,
        controller,
        harness,
        engine,
        cluster,
        diagnostics,
        heartbeat,
    }
}

struct Suite {
    _dir: tempfile::TempDir,
    runner: TestRunner,
    engine: Arc<FakeEngine>,
    cluster: Arc<Cluster>,
    diagnostics: OutputBuffer,
    heartbeat: PathBuf,
}

async fn suite(cluster: Cluster, tune: impl FnOnce(&mut HarnessConfig)) -> Suite {
    let parts = parts(cluster, tune).await;
    Suite {
        _dir: parts.dir,
        runner: TestRunner::new(parts.controller, parts.harness, all_scenarios()),
        engine: parts.engine,
        cluster: parts.cluster,
        diagnostics: parts.diagnostics,
        heartbeat: parts.heartbeat,
    }
}

/// Asserts the proxy ran at some point and is no longer running.
async fn assert_proxy_stopped(heartbeat: &Path) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    let before = std::fs::metadata(heartbeat).unwrap().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = std::fs::metadata(heartbeat).unwrap().len();

    assert!(before > 0, "proxy never ran");
    assert_eq!(before, after, "proxy is still running");
}

fn failed_assertion(results: &RunResults, scenario: &str) -> (String, String) {
    let result = results
        .results
        .iter()
        .find(|r| r.scenario_id == scenario)
        .unwrap();
    assert!(!result.passed, "{scenario} should have failed");
    let assertion = result.assertions.iter().find(|a| !a.passed).unwrap();
    (assertion.name.clone(), assertion.actual.clone())
}

#[tokio::test]
async fn test_suite_passes_once_system_settles() {
    let suite = suite(
        Cluster {
            ready: true,
            routes_deployments: true,
            ..Default::default()
        },
        |_| {},
    )
    .await;

    let results = suite.runner.run_all().await.unwrap();

    assert!(results.all_passed(), "{:#?}", results.results);
    assert_eq!(results.total_count(), 2);
    assert!(suite.diagnostics.is_empty(), "{}", suite.diagnostics.contents());
    assert_eq!(
        *suite.cluster.connected.lock().unwrap(),
        vec!["http://127.0.0.1:8080"]
    );
    assert_eq!(suite.cluster.submitted.lock().unwrap()[0].id, "/whoami");
    assert_eq!(*suite.engine.calls.lock().unwrap(), vec!["up", "down"]);
    assert_proxy_stopped(&suite.heartbeat).await;
}

#[tokio::test]
async fn test_unrouted_workload_fails_and_dumps_proxy_output() {
    let suite = suite(
        Cluster {
            ready: true,
            routes_deployments: false,
            ..Default::default()
        },
        |config| config.orchestrator.route_timeout_secs = 1,
    )
    .await;

    let results = suite
        .runner
        .run(&RunConfig::new().with_filter("deployment"))
        .await
        .unwrap();

    let (name, actual) = failed_assertion(&results, "deployment");
    assert_eq!(name, "Assertion");
    assert!(actual.contains("expected status 200 OK, got 404 Not Found"), "{actual}");

    let report = suite.diagnostics.contents();
    assert!(report.contains("==== proxy output (failed: "), "{report}");
    assert!(report.contains("proxy loaded --configFile="), "{report}");

    // The rendered config went away with the proxy.
    let rendered = report
        .lines()
        .find_map(|line| line.strip_prefix("proxy loaded --configFile="))
        .unwrap();
    assert!(!Path::new(rendered).exists());
    assert_proxy_stopped(&suite.heartbeat).await;
}

#[tokio::test]
async fn test_rejected_submission_stops_proxy_and_dumps_shutdown_output() {
    let suite = suite(
        Cluster {
            ready: true,
            rejects_submissions: true,
            ..Default::default()
        },
        |config| config.proxy.stop_grace_ms = Some(2_000),
    )
    .await;

    let results = suite
        .runner
        .run(&RunConfig::new().with_filter("deployment"))
        .await
        .unwrap();

    let (name, actual) = failed_assertion(&results, "deployment");
    assert_eq!(name, "Orchestrator");
    assert!(actual.contains("app is locked"), "{actual}");

    let report = suite.diagnostics.contents();
    assert!(report.contains("==== proxy output (failed: orchestrator error"), "{report}");
    assert!(report.contains("proxy loaded --configFile="), "{report}");
    // Written after SIGTERM, so the proxy was stopped before the report.
    assert!(report.contains("proxy shutting down"), "{report}");
    assert!(report.ends_with("==== end of proxy output ====\n"), "{report}");
    assert_proxy_stopped(&suite.heartbeat).await;
}

#[tokio::test]
async fn test_abandoned_scenario_kills_proxy_and_dumps_output() {
    let parts = parts(
        Cluster {
            ready: true,
            stalls_deployments: true,
            ..Default::default()
        },
        |_| {},
    )
    .await;
    let mut environment = parts.controller.create("marathon").unwrap();
    parts.controller.start(&mut environment).await.unwrap();

    let scenario = DeploymentScenario::new();
    let ctx = parts.harness.context(&environment);
    let run = tokio::time::timeout(Duration::from_secs(2), scenario.run(&ctx)).await;

    assert!(run.is_err(), "scenario should still be waiting for the deployment");
    let report = parts.diagnostics.contents();
    assert!(report.contains("==== proxy output (scenario did not complete) ===="), "{report}");
    assert!(report.contains("proxy loaded --configFile="), "{report}");
    assert_proxy_stopped(&parts.heartbeat).await;

    parts.controller.stop(&mut environment).await.unwrap();
}

#[tokio::test]
async fn test_unready_orchestrator_reports_last_cause() {
    let suite = suite(
        Cluster {
            ready: false,
            ..Default::default()
        },
        |config| config.orchestrator.ping_timeout_secs = 1,
    )
    .await;

    let results = suite
        .runner
        .run(&RunConfig::new().with_filter("deployment"))
        .await
        .unwrap();

    let (name, actual) = failed_assertion(&results, "deployment");
    assert_eq!(name, "Retry exhausted");
    assert!(actual.contains("orchestrator ping not reached"), "{actual}");
    assert!(actual.contains("leader election in progress"), "{actual}");
    assert!(suite.cluster.submitted.lock().unwrap().is_empty());
    // The proxy never started, so there is nothing to dump.
    assert!(suite.diagnostics.is_empty());
    assert_eq!(*suite.engine.calls.lock().unwrap(), vec!["up", "down"]);
}

#[tokio::test]
async fn test_missing_proxy_binary_is_a_setup_failure() {
    let suite = suite(Cluster::default(), |config| {
        config.proxy.binary = "/nonexistent/traefik".to_string();
        config.proxy.args.clear();
    })
    .await;

    let results = suite
        .runner
        .run(&RunConfig::new().with_filter("unrouted"))
        .await
        .unwrap();

    let (name, actual) = failed_assertion(&results, "unrouted");
    assert_eq!(name, "Setup");
    assert!(actual.contains("/nonexistent/traefik"), "{actual}");
}
