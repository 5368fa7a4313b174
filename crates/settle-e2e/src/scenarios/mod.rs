//! Test scenarios for the proxy/orchestrator suite.
//!
//! This module defines the `TestScenario` trait and the concrete scenarios.
//!
//! # Architecture
//!
//! Each scenario runs inside the suite environment the runner started:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      TestScenario                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. resolve   → orchestrator address from the environment       │
//! │  2. start     → proxy with a rendered config, output captured   │
//! │  3. wait      → readiness, deployment, routing via the poller   │
//! │  4. finish    → kill the proxy, dump its output on failure      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod deployment;
mod unrouted;

pub use deployment::DeploymentScenario;
pub use unrouted::UnroutedScenario;

use crate::context::ScenarioContext;
use crate::models::{Assertion, TestResult};
use async_trait::async_trait;
use settle_core::{
    EnvironmentError, OrchestratorError, PollError, SupervisorError, TemplateError,
};
use std::fmt;
use thiserror::Error;

/// Errors that end a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The environment, config or process could not be set up. Never retried.
    #[error("setup failed: {0}")]
    Setup(String),

    /// A condition never held within its timeout.
    #[error("{condition} not reached within {timeout:?} after {attempts} attempt(s): {cause}")]
    RetryExhausted {
        condition: String,
        timeout: std::time::Duration,
        attempts: u32,
        cause: String,
    },

    /// Workload submission or deployment wait failed.
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// The final expected state was not observed.
    #[error("assertion '{name}' failed: expected {expected}, got {actual}")]
    Assertion {
        name: String,
        expected: String,
        actual: String,
    },
}

impl ScenarioError {
    /// Wraps a poll failure, keeping the last observed cause.
    pub fn exhausted<E: fmt::Display>(condition: impl Into<String>, err: &PollError<E>) -> Self {
        let cause = match err.last() {
            Some(last) => last.to_string(),
            None => err.to_string(),
        };
        Self::RetryExhausted {
            condition: condition.into(),
            timeout: err.timeout(),
            attempts: err.attempts(),
            cause,
        }
    }

    /// Short name of the error class, used as the failed assertion name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "Setup",
            Self::RetryExhausted { .. } => "Retry exhausted",
            Self::Orchestrator(_) => "Orchestrator",
            Self::Assertion { .. } => "Assertion",
        }
    }
}

impl From<EnvironmentError> for ScenarioError {
    fn from(err: EnvironmentError) -> Self {
        Self::Setup(err.to_string())
    }
}

impl From<SupervisorError> for ScenarioError {
    fn from(err: SupervisorError) -> Self {
        Self::Setup(err.to_string())
    }
}

impl From<TemplateError> for ScenarioError {
    fn from(err: TemplateError) -> Self {
        Self::Setup(err.to_string())
    }
}

/// A test scenario executed against the suite environment.
#[async_trait]
pub trait TestScenario: Send + Sync {
    /// Unique identifier for the scenario (e.g., "unrouted").
    fn id(&self) -> &str;

    /// Human-readable description of what the scenario tests.
    fn description(&self) -> &str;

    /// The tier this scenario belongs to (e.g., "Tier 1: Proxy startup").
    fn tier(&self) -> &str;

    /// Runs the scenario and returns the test result.
    ///
    /// Any process the scenario starts must be stopped before this returns,
    /// whatever the outcome.
    async fn run(&self, ctx: &ScenarioContext<'_>) -> Result<TestResult, ScenarioError>;
}

/// Builder for creating assertions with a fluent API.
#[derive(Debug, Clone)]
pub struct AssertionBuilder {
    name: String,
    expected: String,
    actual: String,
    passed: bool,
}

impl AssertionBuilder {
    /// Creates a new assertion with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected: String::new(),
            actual: String::new(),
            passed: false,
        }
    }

    /// Sets the expected value.
    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = expected.into();
        self
    }

    /// Sets the actual value.
    pub fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = actual.into();
        self
    }

    /// Marks the assertion as passed.
    pub fn passed(mut self) -> Self {
        self.passed = true;
        self
    }

    /// Builds the assertion.
    pub fn build(self) -> Assertion {
        Assertion {
            name: self.name,
            passed: self.passed,
            expected: self.expected,
            actual: self.actual,
        }
    }

    /// Converts a failed expectation into the matching scenario error.
    pub fn into_error(self) -> ScenarioError {
        ScenarioError::Assertion {
            name: self.name,
            expected: self.expected,
            actual: self.actual,
        }
    }
}
