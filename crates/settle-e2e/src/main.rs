//! # settle-e2e
//!
//! Runs the proxy/orchestrator scenarios against a compose environment.
//!
//! ## Usage
//!
//! ```bash
//! # Run every scenario with the stock configuration
//! settle-e2e
//!
//! # Run one scenario with a custom config and proxy build
//! settle-e2e --config settle.yml --proxy-binary ./dist/traefik --filter deployment
//!
//! # List available scenarios
//! settle-e2e --list
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use settle_core::{EnvironmentController, HarnessConfig};
use settle_e2e::{
    Harness, ReportFormat as LibReportFormat, ReportWriter, RunConfig, TerminalReporter,
    TestRunner, Verbosity, all_scenarios, create_progress_callback,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// E2E harness for a reverse proxy fronting an orchestrator.
///
/// Starts the compose environment, drives the proxy and the orchestrator
/// through each scenario, and waits for the system to settle.
#[derive(Parser, Debug)]
#[command(name = "settle-e2e")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Harness configuration file (YAML)
    #[arg(short, long, env = "SETTLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Proxy binary to test (overrides the config)
    #[arg(long, env = "SETTLE_PROXY_BINARY")]
    pub proxy_binary: Option<String>,

    /// Show detailed output during tests
    #[arg(short, long)]
    pub verbose: bool,

    /// Only show pass/fail summary
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// List available test scenarios without running them
    #[arg(long)]
    pub list: bool,

    /// Run only tests matching this pattern
    #[arg(long)]
    pub filter: Option<String>,

    /// Keep the environment running after the tests
    #[arg(long)]
    pub keep_environment: bool,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Terminal)]
    pub report: ReportFormat,

    /// Where the JSON report is written
    #[arg(long, default_value = ".e2e-tests/report.json")]
    pub report_path: PathBuf,
}

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReportFormat {
    /// Colored terminal summary
    #[default]
    Terminal,
    /// Terminal summary plus a JSON report file
    Json,
}

impl ReportFormat {
    fn to_lib_format(self) -> LibReportFormat {
        match self {
            ReportFormat::Terminal => LibReportFormat::Terminal,
            ReportFormat::Json => LibReportFormat::Json,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "settle_e2e=debug,settle_core=debug"
    } else {
        "settle_e2e=info,settle_core=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Loads the config file, or the stock config with fixtures shipped alongside this crate.
fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => {
            let mut config = HarnessConfig::default();
            config.resolve_paths(Path::new(env!("CARGO_MANIFEST_DIR")));
            config
        }
    };

    if let Some(binary) = &cli.proxy_binary {
        config.proxy.binary.clone_from(binary);
    }
    if cli.keep_environment {
        config.environment.keep = true;
    }
    Ok(config)
}

fn list_scenarios() {
    let scenarios = all_scenarios();
    println!("{}\n", "Available scenarios:".bold());

    let mut current_tier = String::new();
    for scenario in &scenarios {
        if scenario.tier() != current_tier {
            current_tier = scenario.tier().to_string();
            println!("  {}", current_tier.bold().underline());
        }

        println!(
            "    {}  {}",
            scenario.id().cyan(),
            scenario.description().dimmed()
        );
    }

    println!(
        "\n  {}",
        format!(
            "Total: {} scenario{}",
            scenarios.len(),
            if scenarios.len() == 1 { "" } else { "s" }
        )
        .dimmed()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    println!(
        "\n{} {}",
        "Settle E2E Harness".bold(),
        format!("v{}", settle_e2e::VERSION).dimmed()
    );
    println!("{}", "━".repeat(40).dimmed());

    if cli.list {
        list_scenarios();
        return Ok(());
    }

    let verbosity = if cli.quiet {
        Verbosity::Quiet
    } else if cli.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    };

    let config = load_config(&cli)?;
    if verbosity != Verbosity::Quiet {
        let compose_file = config
            .environment
            .compose_dir
            .join(format!("{}.yml", config.environment.name));
        println!(
            "{}",
            format!(
                "Proxy: {}  Environment: {}",
                config.proxy.binary,
                compose_file.display()
            )
            .dimmed()
        );
    }

    let controller = EnvironmentController::docker(&config.environment.compose_dir)
        .with_project_prefix(&config.environment.project_prefix);
    let mut run_config = RunConfig::new().keep_environment(config.environment.keep);
    if let Some(filter) = &cli.filter {
        run_config = run_config.with_filter(filter);
    }

    let runner = TestRunner::new(controller, Harness::new(config), all_scenarios())
        .on_progress(create_progress_callback(verbosity));

    let results = runner.run(&run_config).await.context("test run aborted")?;

    if cli.report.to_lib_format() == LibReportFormat::Json {
        match ReportWriter::new(cli.report_path.clone()).write_json(&results) {
            Ok(path) => {
                if verbosity != Verbosity::Quiet {
                    println!("{}", format!("Report written: {}", path.display()).dimmed());
                }
            }
            Err(e) => {
                eprintln!("{} Failed to write report: {}", "Warning:".yellow(), e);
            }
        }
    }

    let reporter = TerminalReporter::with_verbosity(verbosity);
    if verbosity != Verbosity::Quiet && !results.all_passed() {
        reporter.print_failures(&results);
    }
    reporter.print_summary(&results);

    if !results.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}
