//! Test runner for suite execution.
//!
//! The TestRunner owns the suite environment: it starts it once, runs the
//! matching scenarios against it in order, and tears it down afterwards.
//!
//! # Example
//!
//! ```no_run
//! use settle_core::{EnvironmentController, HarnessConfig};
//! use settle_e2e::{Harness, RunConfig, TestRunner, TestScenario, UnroutedScenario};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HarnessConfig::default();
//!     let controller = EnvironmentController::docker(&config.environment.compose_dir);
//!     let scenarios: Vec<Box<dyn TestScenario>> = vec![Box::new(UnroutedScenario::new())];
//!
//!     let runner = TestRunner::new(controller, Harness::new(config), scenarios);
//!     let results = runner.run(&RunConfig::new()).await.unwrap();
//!
//!     println!("Passed: {}", results.passed_count());
//! }
//! ```

use crate::context::Harness;
use crate::models::{Assertion, TestResult};
use crate::scenarios::TestScenario;
use settle_core::{EnvironmentController, EnvironmentError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The suite environment could not be created or started.
    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    /// No scenarios matched the filter.
    #[error("no scenarios matched filter: {0}")]
    NoMatchingScenarios(String),
}

/// Configuration for a test run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Filter scenarios by pattern (matches scenario ID, description or tier).
    pub filter: Option<String>,

    /// Leave the environment running after the run.
    pub keep_environment: bool,
}

impl RunConfig {
    /// Creates a new run configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter pattern.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sets whether to keep the environment.
    pub fn keep_environment(mut self, keep: bool) -> Self {
        self.keep_environment = keep;
        self
    }
}

/// Aggregated results from a test run.
#[derive(Debug, Clone, Default)]
pub struct RunResults {
    /// Individual test results.
    pub results: Vec<TestResult>,

    /// Total duration of the run.
    pub duration: Duration,

    /// Why tearing down the environment failed, if it did.
    pub teardown_error: Option<String>,
}

impl RunResults {
    /// Returns the number of passed tests.
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Returns the number of failed tests.
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }

    /// Returns the total number of tests run.
    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    /// Returns true if all tests passed and the environment was torn down cleanly.
    pub fn all_passed(&self) -> bool {
        self.teardown_error.is_none() && self.results.iter().all(|r| r.passed)
    }

    /// Returns only failed results.
    pub fn failures(&self) -> Vec<&TestResult> {
        self.results.iter().filter(|r| !r.passed).collect()
    }
}

/// Progress callback for test execution updates.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Events emitted during test execution.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A test run has started.
    RunStarted { total_scenarios: usize },

    /// The suite environment is up.
    EnvironmentReady { project: String },

    /// A scenario is about to execute.
    ScenarioStarted { scenario_id: String, tier: String },

    /// A scenario has completed.
    ScenarioCompleted {
        scenario_id: String,
        passed: bool,
        duration: Duration,
        result: TestResult,
    },

    /// The test run has completed.
    RunCompleted { results: RunResults },
}

/// Orchestrates scenario execution inside one suite environment.
pub struct TestRunner {
    /// Creates and tears down the suite environment.
    controller: EnvironmentController,

    /// Services lent to every scenario.
    harness: Harness,

    /// Registered test scenarios.
    scenarios: Vec<Box<dyn TestScenario>>,

    /// Progress callback for updates.
    on_progress: Option<ProgressCallback>,
}

impl TestRunner {
    /// Creates a new test runner.
    pub fn new(
        controller: EnvironmentController,
        harness: Harness,
        scenarios: Vec<Box<dyn TestScenario>>,
    ) -> Self {
        Self {
            controller,
            harness,
            scenarios,
            on_progress: None,
        }
    }

    /// Sets a callback for progress updates.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Returns the number of registered scenarios.
    pub fn scenario_count(&self) -> usize {
        self.scenarios.len()
    }

    /// Returns scenarios matching the given config.
    pub fn matching_scenarios(&self, config: &RunConfig) -> Vec<&dyn TestScenario> {
        self.scenarios
            .iter()
            .filter(|s| Self::matches_config(s.as_ref(), config))
            .map(|s| s.as_ref())
            .collect()
    }

    /// Runs all scenarios matching the configuration.
    ///
    /// A failure to bring the environment up aborts the run before any
    /// scenario starts. Scenario failures are recorded, not propagated.
    pub async fn run(&self, config: &RunConfig) -> Result<RunResults, RunnerError> {
        let start = Instant::now();
        let matching = self.matching_scenarios(config);

        if matching.is_empty()
            && let Some(filter) = &config.filter
        {
            return Err(RunnerError::NoMatchingScenarios(filter.clone()));
        }

        self.emit_progress(ProgressEvent::RunStarted {
            total_scenarios: matching.len(),
        });

        let env_config = &self.harness.config().environment;
        let mut environment = self.controller.create(&env_config.name)?;
        self.controller.start(&mut environment).await?;
        self.emit_progress(ProgressEvent::EnvironmentReady {
            project: environment.project().name.clone(),
        });

        let mut results = Vec::new();
        for scenario in matching {
            let scenario_id = scenario.id().to_string();
            let tier = scenario.tier().to_string();
            self.emit_progress(ProgressEvent::ScenarioStarted {
                scenario_id: scenario_id.clone(),
                tier: tier.clone(),
            });

            let scenario_start = Instant::now();
            let ctx = self.harness.context(&environment);
            let outcome = scenario.run(&ctx).await;
            let scenario_duration = scenario_start.elapsed();

            let result = match outcome {
                Ok(test_result) => test_result,
                Err(e) => {
                    warn!(scenario = %scenario_id, error = %e, "scenario failed");
                    TestResult {
                        scenario_id: scenario_id.clone(),
                        scenario_description: scenario.description().to_string(),
                        tier,
                        passed: false,
                        assertions: vec![Assertion {
                            name: e.kind().to_string(),
                            passed: false,
                            expected: "Scenario completes successfully".to_string(),
                            actual: format!("Error: {}", e),
                        }],
                        duration: scenario_duration,
                    }
                }
            };

            self.emit_progress(ProgressEvent::ScenarioCompleted {
                scenario_id,
                passed: result.passed,
                duration: scenario_duration,
                result: result.clone(),
            });
            results.push(result);
        }

        let keep = config.keep_environment || env_config.keep;
        let teardown_error = if keep {
            info!(project = %environment.project().name, "keeping environment");
            None
        } else {
            match self.controller.stop(&mut environment).await {
                Ok(()) => None,
                Err(err) => {
                    warn!(error = %err, "failed to tear down environment");
                    Some(err.to_string())
                }
            }
        };

        let run_results = RunResults {
            results,
            duration: start.elapsed(),
            teardown_error,
        };

        self.emit_progress(ProgressEvent::RunCompleted {
            results: run_results.clone(),
        });

        Ok(run_results)
    }

    /// Runs all registered scenarios with default configuration.
    pub async fn run_all(&self) -> Result<RunResults, RunnerError> {
        self.run(&RunConfig::default()).await
    }

    /// Checks if a scenario matches the run configuration.
    fn matches_config(scenario: &dyn TestScenario, config: &RunConfig) -> bool {
        let Some(filter) = &config.filter else {
            return true;
        };

        let filter_lower = filter.to_lowercase();
        scenario.id().to_lowercase().contains(&filter_lower)
            || scenario
                .description()
                .to_lowercase()
                .contains(&filter_lower)
            || scenario.tier().to_lowercase().contains(&filter_lower)
    }

    /// Emits a progress event if a callback is registered.
    fn emit_progress(&self, event: ProgressEvent) {
        if let Some(callback) = &self.on_progress {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScenarioContext;
    use crate::scenarios::ScenarioError;
    use async_trait::async_trait;
    use settle_core::{ComposeProject, ContainerDetails, ContainerEngine, HarnessConfig};
    use std::sync::{Arc, Mutex};

    /// Mock scenario for testing.
    struct MockScenario {
        id: String,
        description: String,
        tier: String,
        outcome: MockOutcome,
    }

    #[derive(Clone, Copy)]
    enum MockOutcome {
        Pass,
        Fail,
        Error,
    }

    impl MockScenario {
        fn new(id: &str, outcome: MockOutcome) -> Self {
            Self {
                id: id.to_string(),
                description: format!("Mock scenario {}", id),
                tier: "Tier 0: Mock".to_string(),
                outcome,
            }
        }
    }

    #[async_trait]
    impl TestScenario for MockScenario {
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
            assert!(ctx.environment().is_running());
            let passed = match self.outcome {
                MockOutcome::Pass => true,
                MockOutcome::Fail => false,
                MockOutcome::Error => {
                    return Err(ScenarioError::Setup("proxy binary not found".to_string()));
                }
            };
            Ok(TestResult {
                scenario_id: self.id.clone(),
                scenario_description: self.description.clone(),
                tier: self.tier.clone(),
                passed,
                assertions: vec![Assertion {
                    name: "Mock assertion".to_string(),
                    passed,
                    expected: "pass".to_string(),
                    actual: if passed { "pass" } else { "fail" }.to_string(),
                }],
                duration: Duration::from_millis(100),
            })
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        calls: Mutex<Vec<&'static str>>,
        fail_up: bool,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn up(&self, _project: &ComposeProject) -> Result<(), EnvironmentError> {
            self.calls.lock().unwrap().push("up");
            if self.fail_up {
                return Err(EnvironmentError::CommandFailed {
                    command: "docker compose up".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "pull access denied".to_string(),
                });
            }
            Ok(())
        }

        async fn down(&self, _project: &ComposeProject) -> Result<(), EnvironmentError> {
            self.calls.lock().unwrap().push("down");
            Ok(())
        }

        async fn containers(
            &self,
            _project: &ComposeProject,
            _service: &str,
        ) -> Result<Vec<ContainerDetails>, EnvironmentError> {
            Ok(Vec::new())
        }
    }

    fn runner(
        engine: Arc<FakeEngine>,
        scenarios: Vec<Box<dyn TestScenario>>,
    ) -> (tempfile::TempDir, TestRunner) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marathon.yml"), "services: {}\n").unwrap();
        let controller = EnvironmentController::new(engine, dir.path());
        let runner = TestRunner::new(controller, Harness::new(HarnessConfig::default()), scenarios);
        (dir, runner)
    }

    fn mixed() -> Vec<Box<dyn TestScenario>> {
        vec![
            Box::new(MockScenario::new("alpha", MockOutcome::Pass)),
            Box::new(MockScenario::new("beta", MockOutcome::Fail)),
            Box::new(MockScenario::new("gamma", MockOutcome::Error)),
        ]
    }

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::new();
        assert!(config.filter.is_none());
        assert!(!config.keep_environment);
        assert_eq!(
            RunConfig::new().with_filter("unrouted").filter,
            Some("unrouted".to_string())
        );
    }

    #[test]
    fn test_run_results_counts() {
        let result = |passed| TestResult {
            scenario_id: "t".to_string(),
            scenario_description: "T".to_string(),
            tier: "Tier 1".to_string(),
            passed,
            assertions: vec![],
            duration: Duration::from_secs(1),
        };
        let mut results = RunResults {
            results: vec![result(true), result(false), result(true)],
            duration: Duration::from_secs(3),
            teardown_error: None,
        };

        assert_eq!(results.passed_count(), 2);
        assert_eq!(results.failed_count(), 1);
        assert_eq!(results.total_count(), 3);
        assert!(!results.all_passed());

        results.results.remove(1);
        assert!(results.all_passed());
        results.teardown_error = Some("docker gone".to_string());
        assert!(!results.all_passed());
    }

    #[tokio::test]
    async fn test_run_records_every_outcome_and_tears_down() {
        let engine = Arc::new(FakeEngine::default());
        let (_dir, runner) = runner(engine.clone(), mixed());

        let results = runner.run_all().await.unwrap();

        assert_eq!(results.total_count(), 3);
        assert_eq!(results.passed_count(), 1);
        let errored = &results.results[2];
        assert!(!errored.passed);
        assert_eq!(errored.assertions[0].name, "Setup");
        assert!(errored.assertions[0].actual.contains("proxy binary not found"));
        assert_eq!(*engine.calls.lock().unwrap(), vec!["up", "down"]);
    }

    #[tokio::test]
    async fn test_keep_environment_skips_teardown() {
        let engine = Arc::new(FakeEngine::default());
        let (_dir, runner) = runner(engine.clone(), mixed());

        runner
            .run(&RunConfig::new().keep_environment(true))
            .await
            .unwrap();

        assert_eq!(*engine.calls.lock().unwrap(), vec!["up"]);
    }

    #[tokio::test]
    async fn test_filter_selects_scenarios() {
        let engine = Arc::new(FakeEngine::default());
        let (_dir, runner) = runner(engine, mixed());

        let results = runner.run(&RunConfig::new().with_filter("BETA")).await.unwrap();
        assert_eq!(results.total_count(), 1);
        assert_eq!(results.results[0].scenario_id, "beta");

        let err = runner
            .run(&RunConfig::new().with_filter("nothing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NoMatchingScenarios(f) if f == "nothing"));
    }

    #[tokio::test]
    async fn test_environment_start_failure_aborts_run() {
        let engine = Arc::new(FakeEngine {
            fail_up: true,
            ..Default::default()
        });
        let (_dir, runner) = runner(engine.clone(), mixed());

        let err = runner.run_all().await.unwrap_err();

        assert!(matches!(err, RunnerError::Environment(_)));
        assert_eq!(*engine.calls.lock().unwrap(), vec!["up", "down"]);
    }

    #[tokio::test]
    async fn test_progress_events_in_order() {
        let engine = Arc::new(FakeEngine::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let (_dir, runner) = runner(engine, mixed());
        let runner = runner.on_progress(Box::new(move |event| {
            let tag = match event {
                ProgressEvent::RunStarted { .. } => "run-started",
                ProgressEvent::EnvironmentReady { .. } => "env-ready",
                ProgressEvent::ScenarioStarted { .. } => "started",
                ProgressEvent::ScenarioCompleted { .. } => "completed",
                ProgressEvent::RunCompleted { .. } => "run-completed",
            };
            sink.lock().unwrap().push(tag);
        }));

        runner.run(&RunConfig::new().with_filter("alpha")).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["run-started", "env-ready", "started", "completed", "run-completed"]
        );
    }
}
