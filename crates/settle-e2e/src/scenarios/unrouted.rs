//! Tier 1: the proxy answers before anything is routed.
//!
//! With only the orchestrator provider configured and no workload deployed,
//! any path on the entrypoint must come back as 404.

use super::{AssertionBuilder, ScenarioError, TestScenario};
use crate::context::ScenarioContext;
use crate::models::{Assertion, TestResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use settle_core::TemplateValues;
use std::time::Instant;

/// Template placeholder carrying the orchestrator's base URL.
pub(crate) const ORCHESTRATOR_URL_KEY: &str = "MarathonURL";

/// Starts the proxy with no matching route and expects 404 on an unrouted path.
pub struct UnroutedScenario {
    id: String,
    description: String,
    tier: String,
    path: String,
}

impl UnroutedScenario {
    /// Creates the scenario probing `/`.
    pub fn new() -> Self {
        Self {
            id: "unrouted".to_string(),
            description: "Proxy answers 404 for a path with no configured route".to_string(),
            tier: "Tier 1: Proxy startup".to_string(),
            path: "/".to_string(),
        }
    }

    /// Probes `path` instead of `/`.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    async fn exercise(&self, ctx: &ScenarioContext<'_>) -> Result<Vec<Assertion>, ScenarioError> {
        let url = ctx.config().proxy.url(&self.path);
        let timeout = ctx.config().orchestrator.unrouted_timeout();
        let expected = StatusCode::NOT_FOUND;

        let check = AssertionBuilder::new("Unrouted path returns 404")
            .expected(format!("{expected} from {url} within {timeout:?}"));
        match ctx.wait_for_status(&url, expected, timeout).await {
            Ok(status) => Ok(vec![check.actual(status.to_string()).passed().build()]),
            Err(err) => Err(check.actual(err.to_string()).into_error()),
        }
    }
}

impl Default for UnroutedScenario {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestScenario for UnroutedScenario {
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
        let values = TemplateValues::from([(ORCHESTRATOR_URL_KEY.to_string(), orchestrator_url)]);

        let proxy = ctx.start_proxy(&values)?;
        let report = ctx.watch(&proxy);
        let outcome = self.exercise(ctx).await;
        let assertions = proxy.finish(report, outcome).await?;

        Ok(TestResult::from_assertions(
            &self.id,
            &self.description,
            &self.tier,
            assertions,
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let scenario = UnroutedScenario::default();
        assert_eq!(scenario.id(), "unrouted");
        assert_eq!(scenario.tier(), "Tier 1: Proxy startup");
        assert_eq!(scenario.path, "/");
        assert_eq!(scenario.with_path("/nowhere").path, "/nowhere");
    }
}
