//! Tier 2: a deployed workload becomes reachable through the proxy.
//!
//! The proxy watches the orchestrator. Once a labelled workload finishes
//! deploying, the proxy has to pick it up and route its path prefix to it.

use super::unrouted::ORCHESTRATOR_URL_KEY;
use super::{AssertionBuilder, ScenarioError, TestScenario};
use crate::context::ScenarioContext;
use crate::models::{Assertion, TestResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use settle_core::{Orchestrator, TemplateValues, WorkloadSpec};
use std::time::Instant;
use tracing::info;

/// Deploys a workload through the orchestrator and expects the proxy to route to it.
pub struct DeploymentScenario {
    id: String,
    description: String,
    tier: String,
    workload: WorkloadSpec,
    route: String,
}

impl DeploymentScenario {
    /// Creates the scenario with the stock `whoami` workload on `/service`.
    pub fn new() -> Self {
        let workload = WorkloadSpec::docker("/whoami", "emilevauge/whoami")
            .cpus(0.1)
            .mem(32.0)
            .label("traefik.frontend.rule", "PathPrefix:/service")
            .label("traefik.port", "80");
        Self {
            id: "deployment".to_string(),
            description: "Workload deployed via the orchestrator is routed by the proxy"
                .to_string(),
            tier: "Tier 2: Orchestrator routing".to_string(),
            workload,
            route: "/service".to_string(),
        }
    }

    /// Deploys `workload` and expects it to be served on `route`.
    pub fn with_workload(mut self, workload: WorkloadSpec, route: impl Into<String>) -> Self {
        self.workload = workload;
        self.route = route.into();
        self
    }

    async fn exercise(
        &self,
        ctx: &ScenarioContext<'_>,
        orchestrator: &dyn Orchestrator,
    ) -> Result<Vec<Assertion>, ScenarioError> {
        let config = ctx.config();
        let mut assertions = Vec::new();

        info!(workload = %self.workload.id, "Deploying test workload");
        let deployment = orchestrator.submit_workload(&self.workload).await?;
        assertions.push(
            AssertionBuilder::new("Workload submitted")
                .expected("deployment id")
                .actual(deployment.to_string())
                .passed()
                .build(),
        );

        info!(%deployment, "Waiting for deployment to complete");
        let deploy_timeout = config.orchestrator.deploy_timeout();
        let deploy_start = Instant::now();
        orchestrator
            .await_deployment(&deployment, deploy_timeout)
            .await?;
        assertions.push(
            AssertionBuilder::new("Deployment completed")
                .expected(format!("complete within {deploy_timeout:?}"))
                .actual(format!("completed after {:?}", deploy_start.elapsed()))
                .passed()
                .build(),
        );

        info!(route = %self.route, "Querying workload via proxy");
        let url = config.proxy.url(&self.route);
        let route_timeout = config.orchestrator.route_timeout();
        let expected = StatusCode::OK;
        let check = AssertionBuilder::new("Workload routed")
            .expected(format!("{expected} from {url} within {route_timeout:?}"));
        match ctx.wait_for_status(&url, expected, route_timeout).await {
            Ok(status) => {
                assertions.push(check.actual(status.to_string()).passed().build());
                Ok(assertions)
            }
            Err(err) => Err(check.actual(err.to_string()).into_error()),
        }
    }
}

impl Default for DeploymentScenario {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestScenario for DeploymentScenario {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn tier(&self) -> &str {
        &self.tier
    }

    async fn run(&self, ctx: &ScenarioContext<'_>) -> Result<TestResult, ScenarioError> {
        let start = Instant::now();

        let orchestrator_url = ctx.orchestrator_url().await?;
        let orchestrator = ctx.connect(&orchestrator_url)?;
        let ready = ctx
            .await_orchestrator(
                orchestrator.as_ref(),
                ctx.config().orchestrator.ping_timeout(),
            )
            .await?;

        let values = TemplateValues::from([(ORCHESTRATOR_URL_KEY.to_string(), orchestrator_url)]);
        let proxy = ctx.start_proxy(&values)?;
        let report = ctx.watch(&proxy);
        let outcome = self.exercise(ctx, orchestrator.as_ref()).await;
        let mut assertions = proxy.finish(report, outcome).await?;
        assertions.insert(0, ready);

        Ok(TestResult::from_assertions(
            &self.id,
            &self.description,
            &self.tier,
            assertions,
            start.elapsed(),
        ))
    }
}
