//! Reporters for suite execution.
//!
//! - `TerminalReporter`: colored terminal output for progress and results
//! - `JsonReporter`: machine-readable JSON report generation
//! - `ReportWriter`: writes the JSON report to disk

use crate::models::{TestResult, duration_serde};
use crate::runner::{ProgressEvent, RunResults};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Verbosity level for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Show only pass/fail summary.
    Quiet,
    /// Normal output with progress.
    #[default]
    Normal,
    /// Detailed output including assertions.
    Verbose,
}

/// Terminal reporter for suite results.
#[derive(Debug)]
pub struct TerminalReporter {
    /// Verbosity level.
    verbosity: Verbosity,

    /// Track current tier for grouping output.
    current_tier: Option<String>,
}

impl Default for TerminalReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalReporter {
    /// Creates a new terminal reporter with normal verbosity.
    pub fn new() -> Self {
        Self::with_verbosity(Verbosity::Normal)
    }

    /// Creates a reporter with the specified verbosity.
    pub fn with_verbosity(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            current_tier: None,
        }
    }

    /// Handles a progress event, printing appropriate output.
    pub fn handle_progress(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { total_scenarios } => {
                if self.verbosity != Verbosity::Quiet {
                    print_run_started(total_scenarios);
                }
            }
            ProgressEvent::EnvironmentReady { project } => {
                if self.verbosity == Verbosity::Verbose {
                    println!("{}", format!("Environment ready: {project}").dimmed());
                }
            }
            ProgressEvent::ScenarioStarted { scenario_id, tier } => {
                if self.verbosity != Verbosity::Quiet {
                    self.print_scenario_started(&scenario_id, &tier);
                }
            }
            ProgressEvent::ScenarioCompleted {
                passed,
                duration,
                result,
                ..
            } => {
                if self.verbosity != Verbosity::Quiet {
                    self.print_scenario_completed(passed, duration, &result);
                }
            }
            ProgressEvent::RunCompleted { results } => {
                // Summary is printed separately via print_summary
                if self.verbosity == Verbosity::Quiet {
                    print_quiet_summary(&results);
                }
            }
        }
    }

    /// Prints scenario started with its tier header.
    fn print_scenario_started(&mut self, scenario_id: &str, tier: &str) {
        if self.current_tier.as_deref() != Some(tier) {
            self.current_tier = Some(tier.to_string());
            println!("{}", tier.bold().underline());
        }

        print!("  {} ", scenario_id);
        io::stdout().flush().ok();
    }

    /// Finishes the scenario line; verbose mode lists assertions.
    fn print_scenario_completed(&self, passed: bool, duration: Duration, result: &TestResult) {
        let status = if passed { "✓".green() } else { "✗".red() };
        let duration_str = format!("({:.1}s)", duration.as_secs_f64()).dimmed();
        println!("{} {}", status, duration_str);

        if self.verbosity == Verbosity::Verbose {
            for assertion in &result.assertions {
                let check = if assertion.passed {
                    "└─ ✓".green()
                } else {
                    "└─ ✗".red()
                };
                println!("     {} {}", check, assertion.name);
            }
        }
    }

    /// Prints a full summary of the test run.
    pub fn print_summary(&self, results: &RunResults) {
        println!("\n{}", "━".repeat(40).dimmed());

        let passed = results.passed_count();
        let failed = results.failed_count();
        let total = results.total_count();

        let (verdict, color) = if results.all_passed() {
            ("PASSED", colored::Color::Green)
        } else if passed > 0 {
            ("MIXED", colored::Color::Yellow)
        } else {
            ("FAILED", colored::Color::Red)
        };

        let verdict_text = format!("{}: {} of {} scenarios", verdict, passed, total);
        println!("{}", verdict_text.color(color).bold());
        if failed > 0 {
            println!("   {}", format!("{} failed", failed).red());
        }
        if let Some(err) = &results.teardown_error {
            println!("   {} {}", "Teardown failed:".red(), err);
        }

        println!(
            "\n   {}",
            format!("Completed in {:.1}s", results.duration.as_secs_f64()).dimmed()
        );
    }

    /// Prints detailed results for failed tests.
    pub fn print_failures(&self, results: &RunResults) {
        let failures = results.failures();
        if failures.is_empty() {
            return;
        }

        println!("\n{}", "Failed Scenarios:".red().bold());
        println!();

        for result in failures {
            print_failed_test(result);
        }
    }
}

fn print_run_started(total: usize) {
    println!(
        "\n{}",
        format!(
            "Running {} scenario{}...",
            total,
            if total == 1 { "" } else { "s" }
        )
        .bold()
    );
    println!();
}

fn print_quiet_summary(results: &RunResults) {
    let failed = results.failed_count();
    let total = results.total_count();

    if results.all_passed() {
        println!("{}", format!("✓ {}/{} passed", results.passed_count(), total).green());
    } else {
        println!("{}", format!("✗ {}/{} failed", failed, total).red());
    }
}

fn print_failed_test(result: &TestResult) {
    println!("  {} {}", "✗".red(), result.scenario_id.red().bold());
    println!("     {}", result.scenario_description.dimmed());
    println!();

    for assertion in result.assertions.iter().filter(|a| !a.passed) {
        println!("     {} {}", "✗".red(), assertion.name);
        println!("       Expected: {}", assertion.expected.green());
        println!("       Actual:   {}", assertion.actual.red());
        println!();
    }
}

/// Creates a progress callback for use with TestRunner.
pub fn create_progress_callback(verbosity: Verbosity) -> crate::runner::ProgressCallback {
    let reporter = Arc::new(Mutex::new(TerminalReporter::with_verbosity(verbosity)));

    Box::new(move |event| {
        if let Ok(mut r) = reporter.lock() {
            r.handle_progress(event);
        }
    })
}

/// Errors that can occur during report generation.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// Failed to write report file.
    #[error("failed to write report: {0}")]
    WriteError(#[from] std::io::Error),

    /// Failed to serialize report to JSON.
    #[error("failed to serialize report: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Full test report structure for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Timestamp of the report generation.
    pub timestamp: DateTime<Utc>,

    /// Harness version used.
    pub settle_version: String,

    /// Total duration of the test run.
    #[serde(with = "duration_serde")]
    pub duration: Duration,

    /// Overall pass/fail verdict.
    pub passed: bool,

    /// Verdict message.
    pub verdict: String,

    /// Summary statistics.
    pub summary: ReportSummary,

    /// Individual test results.
    pub results: Vec<TestResult>,

    /// Environment teardown failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
}

/// Summary statistics for the report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Total number of tests.
    pub total: usize,

    /// Number of passed tests.
    pub passed: usize,

    /// Number of failed tests.
    pub failed: usize,

    /// Results grouped by tier.
    pub by_tier: BTreeMap<String, TierSummary>,
}

/// Pass/fail counts for one tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierSummary {
    pub passed: usize,
    pub failed: usize,
}

/// Generates machine-readable JSON reports.
#[derive(Debug, Default)]
pub struct JsonReporter;

impl JsonReporter {
    /// Creates a new JSON reporter.
    pub fn new() -> Self {
        Self
    }

    /// Generates a full JSON report from run results.
    pub fn generate(&self, results: &RunResults) -> Result<String, ReporterError> {
        let report = self.build_report(results);
        serde_json::to_string_pretty(&report).map_err(ReporterError::from)
    }

    /// Builds the report data structure.
    pub fn build_report(&self, results: &RunResults) -> TestReport {
        let passed = results.all_passed();
        let verdict = if passed {
            "All scenarios passed".to_string()
        } else if results.failed_count() == 0 {
            "Scenarios passed but teardown failed".to_string()
        } else {
            format!("{} scenarios failed", results.failed_count())
        };

        let mut by_tier: BTreeMap<String, TierSummary> = BTreeMap::new();
        for result in &results.results {
            let tier = by_tier.entry(result.tier.clone()).or_default();
            if result.passed {
                tier.passed += 1;
            } else {
                tier.failed += 1;
            }
        }

        TestReport {
            timestamp: Utc::now(),
            settle_version: crate::VERSION.to_string(),
            duration: results.duration,
            passed,
            verdict,
            summary: ReportSummary {
                total: results.total_count(),
                passed: results.passed_count(),
                failed: results.failed_count(),
                by_tier,
            },
            results: results.results.clone(),
            teardown_error: results.teardown_error.clone(),
        }
    }
}

/// Writes reports to a file.
#[derive(Debug)]
pub struct ReportWriter {
    /// Destination of the JSON report.
    path: PathBuf,
}

impl ReportWriter {
    /// Creates a writer targeting `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the report path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the JSON report, creating parent directories as needed.
    pub fn write_json(&self, results: &RunResults) -> Result<PathBuf, ReporterError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let content = JsonReporter::new().generate(results)?;
        std::fs::write(&self.path, content)?;

        Ok(self.path.clone())
    }
}
