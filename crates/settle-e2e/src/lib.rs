//! # settle-e2e
//!
//! End-to-end scenarios for a reverse proxy that discovers its routes from an
//! orchestrator.
//!
//! Each scenario waits for the distributed system to settle: the orchestrator
//! to answer, a deployment to complete, the proxy to pick up the new route.
//! Every wait is bounded and reports its last observed cause on failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │  TestRunner │────▶│  Scenarios  │────▶│ ScenarioContext  │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌─────────────┐                         ┌──────────────────┐
//! │  Reporter   │                         │   settle-core    │
//! └─────────────┘                         └──────────────────┘
//! ```

pub mod context;
pub mod models;
pub mod reporter;
pub mod runner;
pub mod scenarios;

pub use context::{Harness, ProxyProcess, ScenarioContext};
pub use models::{Assertion, ReportFormat, TestResult};
pub use reporter::{
    JsonReporter, ReportSummary, ReportWriter, ReporterError, TerminalReporter, TestReport,
    TierSummary, Verbosity, create_progress_callback,
};
pub use runner::{ProgressCallback, ProgressEvent, RunConfig, RunResults, RunnerError, TestRunner};
pub use scenarios::{
    AssertionBuilder, DeploymentScenario, ScenarioError, TestScenario, UnroutedScenario,
};

/// Harness version, as recorded in reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns all registered scenarios in execution order.
pub fn all_scenarios() -> Vec<Box<dyn TestScenario>> {
    vec![
        // Tier 1: Proxy startup
        Box::new(UnroutedScenario::new()),
        // Tier 2: Orchestrator routing
        Box::new(DeploymentScenario::new()),
    ]
}
