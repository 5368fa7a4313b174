//! Harness configuration loaded from YAML.
//!
//! Every field has a default, so an empty file (or no file) describes the
//! stock Marathon suite. Relative paths in a loaded file are resolved against
//! the file's directory.

use crate::poller::Poller;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading the harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub environment: EnvironmentConfig,
    pub proxy: ProxyConfig,
    pub polling: PollingConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Where the multi-container environment comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Directory holding `<name>.yml` compose files.
    pub compose_dir: PathBuf,
    pub name: String,
    pub project_prefix: String,
    /// Leave the environment running after the suite.
    pub keep: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            compose_dir: PathBuf::from("fixtures/compose"),
            name: "marathon".to_string(),
            project_prefix: "settle".to_string(),
            keep: false,
        }
    }
}

/// How to launch the proxy under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub binary: String,
    /// Extra arguments placed before the config flag.
    pub args: Vec<String>,
    pub config_flag: String,
    pub config_template: PathBuf,
    /// Base URL of the proxy's HTTP entrypoint.
    pub entrypoint: String,
    /// SIGTERM grace window; absent means kill immediately.
    pub stop_grace_ms: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: "traefik".to_string(),
            args: Vec::new(),
            config_flag: "--configFile".to_string(),
            config_template: PathBuf::from("fixtures/marathon/simple.toml"),
            entrypoint: "http://127.0.0.1:8000".to_string(),
            stop_grace_ms: None,
        }
    }
}

impl ProxyConfig {
    pub fn stop_grace(&self) -> Option<Duration> {
        self.stop_grace_ms.map(Duration::from_millis)
    }

    /// URL of `path` on the proxy entrypoint.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.entrypoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Poll interval and per-request bound shared by every wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            request_timeout_ms: 1000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// A poller using the configured interval.
    pub fn poller(&self) -> Poller {
        Poller::new(self.interval())
    }
}

/// The orchestrator service and the scenario time limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Compose service name.
    pub service: String,
    pub port: u16,
    pub ping_timeout_secs: u64,
    pub deploy_timeout_secs: u64,
    pub route_timeout_secs: u64,
    pub unrouted_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service: "marathon".to_string(),
            port: 8080,
            ping_timeout_secs: 60,
            deploy_timeout_secs: 30,
            route_timeout_secs: 5,
            unrouted_timeout_ms: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.route_timeout_secs)
    }

    pub fn unrouted_timeout(&self) -> Duration {
        Duration::from_millis(self.unrouted_timeout_ms)
    }

    /// Base URL of the orchestrator at `address`.
    pub fn url_for(&self, address: &str) -> String {
        format!("http://{}:{}", address, self.port)
    }
}

impl HarnessConfig {
    /// Loads a YAML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parses YAML without touching the filesystem. Empty input gives the defaults.
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Makes relative paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.environment.compose_dir);
        resolve(&mut self.proxy.config_template);
    }
}
