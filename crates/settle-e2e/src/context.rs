//! What a scenario gets to work with.
//!
//! [`Harness`] bundles the suite-wide services built from the configuration.
//! The runner lends it to each scenario together with the running environment
//! as a [`ScenarioContext`].

use crate::models::Assertion;
use crate::scenarios::ScenarioError;
use reqwest::StatusCode;
use settle_core::{
    ConfigTemplater, DiagnosticReporter, Environment, HarnessConfig, HttpProbe, MarathonConnector,
    Orchestrator, OrchestratorFactory, PollError, Poller, ProbeError, ProcessHandle, ProcessSpec,
    ProcessSupervisor, RenderedConfig, ReportGuard, TemplateValues, status_code_is,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Suite-wide services shared by every scenario.
pub struct Harness {
    config: HarnessConfig,
    poller: Poller,
    supervisor: ProcessSupervisor,
    templater: ConfigTemplater,
    diagnostics: DiagnosticReporter,
    orchestrators: Arc<dyn OrchestratorFactory>,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.config)
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Builds the services described by `config`, talking to Marathon and
    /// reporting diagnostics on stderr.
    pub fn new(config: HarnessConfig) -> Self {
        let poller = config.polling.poller();
        let orchestrators = Arc::new(MarathonConnector::new(
            poller,
            config.polling.request_timeout(),
        ));
        Self {
            config,
            poller,
            supervisor: ProcessSupervisor::new(),
            templater: ConfigTemplater::new(),
            diagnostics: DiagnosticReporter::stderr(),
            orchestrators,
        }
    }

    /// Replaces the orchestrator client factory.
    pub fn with_orchestrators(mut self, orchestrators: Arc<dyn OrchestratorFactory>) -> Self {
        self.orchestrators = orchestrators;
        self
    }

    /// Replaces the diagnostic sink.
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticReporter) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Lends the services to one scenario running in `environment`.
    pub fn context<'a>(&'a self, environment: &'a Environment) -> ScenarioContext<'a> {
        ScenarioContext {
            harness: self,
            environment,
        }
    }
}

/// One scenario's view of the harness and the running environment.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioContext<'a> {
    harness: &'a Harness,
    environment: &'a Environment,
}

impl<'a> ScenarioContext<'a> {
    pub fn config(&self) -> &'a HarnessConfig {
        &self.harness.config
    }

    pub fn poller(&self) -> &'a Poller {
        &self.harness.poller
    }

    pub fn environment(&self) -> &'a Environment {
        self.environment
    }

    /// Base URL of the orchestrator service inside the environment.
    pub async fn orchestrator_url(&self) -> Result<String, ScenarioError> {
        let orchestrator = &self.config().orchestrator;
        let address = self.environment.address(&orchestrator.service).await?;
        let url = orchestrator.url_for(&address);
        info!(%url, "Using orchestrator URL");
        Ok(url)
    }

    /// Connects an orchestrator client to `base_url`.
    pub fn connect(&self, base_url: &str) -> Result<Arc<dyn Orchestrator>, ScenarioError> {
        Ok(self.harness.orchestrators.connect(base_url)?)
    }

    /// Polls the orchestrator's ping until it answers or `timeout` elapses.
    pub async fn await_orchestrator(
        &self,
        orchestrator: &dyn Orchestrator,
        timeout: Duration,
    ) -> Result<Assertion, ScenarioError> {
        info!(?timeout, "Waiting for orchestrator to become ready");
        let start = tokio::time::Instant::now();
        self.poller()
            .execute(|| orchestrator.ping(), timeout)
            .await
            .map_err(|err| ScenarioError::exhausted("orchestrator ping", &err))?;

        Ok(Assertion {
            name: "Orchestrator ready".to_string(),
            passed: true,
            expected: format!("ping succeeds within {timeout:?}"),
            actual: format!("ready after {:?}", start.elapsed()),
        })
    }

    /// Renders the proxy config template with `values` and starts the proxy on it.
    pub fn start_proxy(&self, values: &TemplateValues) -> Result<ProxyProcess, ScenarioError> {
        let proxy = &self.config().proxy;
        let rendered = self
            .harness
            .templater
            .render_file(&proxy.config_template, values)?;

        let mut spec = ProcessSpec::new(&proxy.binary)
            .label("proxy")
            .args(proxy.args.iter().cloned())
            .arg(config_arg(&proxy.config_flag, rendered.path()));
        if let Some(grace) = proxy.stop_grace() {
            spec = spec.stop_grace(grace);
        }

        let handle = self.harness.supervisor.start(&spec)?;
        Ok(ProxyProcess {
            handle,
            _config: rendered,
        })
    }

    /// Arms output-on-failure reporting for `proxy`.
    pub fn watch(&self, proxy: &ProxyProcess) -> ReportGuard {
        self.harness
            .diagnostics
            .watch(proxy.handle.label(), proxy.handle.output().clone())
    }

    /// Polls `GET url` until it answers with `status`.
    pub async fn wait_for_status(
        &self,
        url: &str,
        status: StatusCode,
        timeout: Duration,
    ) -> Result<StatusCode, PollError<ProbeError>> {
        debug!(%url, %status, ?timeout, "waiting for status");
        let probe = HttpProbe::get(url)
            .map_err(|last| PollError::Exhausted {
                last,
                attempts: 0,
                timeout,
            })?
            .expect(status_code_is(status))
            .request_timeout(self.config().polling.request_timeout());
        probe.wait(self.poller(), timeout).await
    }
}

fn config_arg(flag: &str, path: &Path) -> String {
    format!("{}={}", flag, path.display())
}

/// The proxy under test together with the config file it was started on.
///
/// Dropping it kills the process first and then deletes the config file.
#[derive(Debug)]
pub struct ProxyProcess {
    handle: ProcessHandle,
    _config: RenderedConfig,
}

impl ProxyProcess {
    /// Stops the proxy, then settles diagnostics with the combined result.
    ///
    /// The scenario's own error wins over a failure to stop. Output the proxy
    /// writes while shutting down is part of the report.
    pub async fn finish<T>(
        mut self,
        report: ReportGuard,
        outcome: Result<T, ScenarioError>,
    ) -> Result<T, ScenarioError> {
        let stopped = self.handle.kill().await;
        let outcome = match (outcome, stopped) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(ScenarioError::from(err)),
            (Ok(value), Ok(())) => Ok(value),
        };
        report.conclude(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_arg_joins_flag_and_path() {
        assert_eq!(
            config_arg("--configFile", Path::new("/tmp/settle-1.toml")),
            "--configFile=/tmp/settle-1.toml"
        );
    }

    #[test]
    fn test_harness_uses_configured_interval() {
        let mut config = HarnessConfig::default();
        config.polling.interval_ms = 40;

        let harness = Harness::new(config);
        assert_eq!(harness.poller.interval(), Duration::from_millis(40));
        assert_eq!(harness.config().polling.interval_ms, 40);
    }
}
