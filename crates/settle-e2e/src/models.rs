//! Data models for the E2E harness.
//!
//! Test results and assertions as produced by scenarios and consumed by the
//! runner and reporters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Colored terminal summary only
    #[default]
    Terminal,
    /// Terminal summary plus a JSON report file
    Json,
}

/// Result of a single scenario execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Unique identifier for the scenario
    pub scenario_id: String,
    /// Human-readable description
    pub scenario_description: String,
    /// Test tier (e.g., "Tier 1: Proxy startup")
    pub tier: String,
    /// Whether the test passed
    pub passed: bool,
    /// Individual assertions checked
    pub assertions: Vec<Assertion>,
    /// How long the test took
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl TestResult {
    /// Builds a result whose verdict follows its assertions.
    pub fn from_assertions(
        scenario_id: impl Into<String>,
        scenario_description: impl Into<String>,
        tier: impl Into<String>,
        assertions: Vec<Assertion>,
        duration: Duration,
    ) -> Self {
        let passed = assertions.iter().all(|a| a.passed);
        Self {
            scenario_id: scenario_id.into(),
            scenario_description: scenario_description.into(),
            tier: tier.into(),
            passed,
            assertions,
            duration,
        }
    }
}

/// A single assertion within a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    /// Name of the assertion
    pub name: String,
    /// Whether the assertion passed
    pub passed: bool,
    /// Expected value/condition
    pub expected: String,
    /// Actual value/condition observed
    pub actual: String,
}

/// Serde helper for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
