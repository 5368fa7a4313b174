//! Lifecycle of a named multi-container test environment.
//!
//! An [`EnvironmentController`] creates [`Environment`]s from compose files,
//! starts and stops them, and resolves service names to network addresses.
//! Starting only waits for the containers to exist; whether the application
//! inside is ready is for the caller to poll against the service itself.
//!
//! Container operations go through the [`ContainerEngine`] trait so tests can
//! run without a container runtime. [`DockerCompose`] is the real engine.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Errors from environment operations.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// No compose file exists for the requested environment.
    #[error("no compose file for environment '{name}' at {path}")]
    ComposeFileMissing { name: String, path: PathBuf },

    /// A lookup was attempted before the environment was started.
    #[error("environment '{0}' is not running")]
    NotRunning(String),

    /// The service has no container in the environment.
    #[error("service '{service}' has no container in environment '{environment}'")]
    ServiceNotFound {
        environment: String,
        service: String,
    },

    /// The service's container has no network address.
    #[error("service '{service}' in environment '{environment}' has no network address")]
    NoAddress {
        environment: String,
        service: String,
    },

    /// A container runtime command could not be run.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A container runtime command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Container metadata could not be parsed.
    #[error("failed to parse container metadata: {0}")]
    Inspect(#[from] serde_json::Error),
}

/// A compose project: unique project name plus the compose file it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    /// Project name passed to the runtime; unique per environment.
    pub name: String,
    /// Compose file describing the services.
    pub file: PathBuf,
}

/// One network a container is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub ip_address: String,
}

/// The parts of a container's metadata the harness needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    /// Attached networks, in a stable order.
    pub networks: Vec<NetworkAttachment>,
}

/// Runs compose projects and reports on their containers.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates and starts every container of the project; returns once they exist.
    async fn up(&self, project: &ComposeProject) -> Result<(), EnvironmentError>;

    /// Stops and removes the project's containers.
    async fn down(&self, project: &ComposeProject) -> Result<(), EnvironmentError>;

    /// Returns the containers backing `service`.
    async fn containers(
        &self,
        project: &ComposeProject,
        service: &str,
    ) -> Result<Vec<ContainerDetails>, EnvironmentError>;
}

/// [`ContainerEngine`] backed by the `docker compose` CLI.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    docker: String,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCompose {
    /// Uses the given docker binary.
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    fn compose_args(project: &ComposeProject, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-p".to_string(),
            project.name.clone(),
            "-f".to_string(),
            project.file.display().to_string(),
        ];
        args.extend(rest.iter().map(|s| (*s).to_string()));
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, EnvironmentError> {
        let command = format!("{} {}", self.docker, args.join(" "));
        debug!(%command, "running container command");

        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EnvironmentError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EnvironmentError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerEngine for DockerCompose {
    async fn up(&self, project: &ComposeProject) -> Result<(), EnvironmentError> {
        self.run(&Self::compose_args(project, &["up", "-d"])).await?;
        Ok(())
    }

    async fn down(&self, project: &ComposeProject) -> Result<(), EnvironmentError> {
        self.run(&Self::compose_args(
            project,
            &["down", "--volumes", "--remove-orphans"],
        ))
        .await?;
        Ok(())
    }

    async fn containers(
        &self,
        project: &ComposeProject,
        service: &str,
    ) -> Result<Vec<ContainerDetails>, EnvironmentError> {
        let ids = self
            .run(&Self::compose_args(project, &["ps", "-q", service]))
            .await?;
        let ids: Vec<String> = ids
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string()];
        args.extend(ids);
        let json = self.run(&args).await?;
        parse_inspect(&json)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    network_settings: InspectNetworkSettings,
}

#[derive(Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "Networks", default)]
    networks: Option<BTreeMap<String, InspectNetwork>>,
}

#[derive(Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Parses `docker inspect` output.
///
/// Networks are ordered by name. When no per-network entry exists, the legacy
/// top-level `IPAddress` is reported as network `bridge`.
pub fn parse_inspect(json: &str) -> Result<Vec<ContainerDetails>, EnvironmentError> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let settings = entry.network_settings;
            let mut networks: Vec<NetworkAttachment> = settings
                .networks
                .unwrap_or_default()
                .into_iter()
                .map(|(network, net)| NetworkAttachment {
                    network,
                    ip_address: net.ip_address,
                })
                .collect();
            if networks.is_empty() && !settings.ip_address.is_empty() {
                networks.push(NetworkAttachment {
                    network: "bridge".to_string(),
                    ip_address: settings.ip_address,
                });
            }
            ContainerDetails {
                id: entry.id,
                networks,
            }
        })
        .collect())
}

/// Lifecycle state of an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentState::Created => write!(f, "created"),
            EnvironmentState::Running => write!(f, "running"),
            EnvironmentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A named set of service containers owned by one suite or scenario.
pub struct Environment {
    name: String,
    project: ComposeProject,
    state: EnvironmentState,
    engine: Arc<dyn ContainerEngine>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("project", &self.project)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Environment name (the compose file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compose project backing the environment.
    pub fn project(&self) -> &ComposeProject {
        &self.project
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    /// Whether the containers have been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.state == EnvironmentState::Running
    }

    /// Starts the containers. Blocks until they exist; a running environment is left alone.
    ///
    /// If start fails, whatever was partially created is torn down again.
    pub async fn start(&mut self) -> Result<(), EnvironmentError> {
        if self.is_running() {
            return Ok(());
        }
        info!(environment = %self.name, project = %self.project.name, "starting environment");
        if let Err(err) = self.engine.up(&self.project).await {
            if let Err(down) = self.engine.down(&self.project).await {
                warn!(
                    project = %self.project.name,
                    error = %down,
                    "cleanup after failed start failed"
                );
            }
            return Err(err);
        }
        self.state = EnvironmentState::Running;
        Ok(())
    }

    /// Stops and removes the containers. Stopping a non-running environment is a no-op.
    pub async fn stop(&mut self) -> Result<(), EnvironmentError> {
        if !self.is_running() {
            return Ok(());
        }
        info!(environment = %self.name, project = %self.project.name, "stopping environment");
        self.engine.down(&self.project).await?;
        self.state = EnvironmentState::Stopped;
        Ok(())
    }

    /// Returns the addresses of `service`, one per attached network.
    pub async fn lookup(&self, service: &str) -> Result<Vec<String>, EnvironmentError> {
        if !self.is_running() {
            return Err(EnvironmentError::NotRunning(self.name.clone()));
        }

        let containers = self.engine.containers(&self.project, service).await?;
        let container = containers
            .into_iter()
            .next()
            .ok_or_else(|| EnvironmentError::ServiceNotFound {
                environment: self.name.clone(),
                service: service.to_string(),
            })?;

        Ok(container
            .networks
            .into_iter()
            .map(|net| net.ip_address)
            .filter(|ip| !ip.is_empty())
            .collect())
    }

    /// Returns the first address of `service`.
    ///
    /// With several networks attached, the first network in the engine's
    /// stable order wins instead of requiring disambiguation.
    pub async fn address(&self, service: &str) -> Result<String, EnvironmentError> {
        self.lookup(service)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EnvironmentError::NoAddress {
                environment: self.name.clone(),
                service: service.to_string(),
            })
    }
}

/// Creates environments from compose files under one directory.
#[derive(Clone)]
pub struct EnvironmentController {
    engine: Arc<dyn ContainerEngine>,
    compose_dir: PathBuf,
    project_prefix: String,
}

impl fmt::Debug for EnvironmentController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentController")
            .field("compose_dir", &self.compose_dir)
            .field("project_prefix", &self.project_prefix)
            .finish_non_exhaustive()
    }
}

impl EnvironmentController {
    /// Creates a controller using `engine` and compose files in `compose_dir`.
    pub fn new(engine: Arc<dyn ContainerEngine>, compose_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            compose_dir: compose_dir.into(),
            project_prefix: "settle".to_string(),
        }
    }

    /// Creates a controller driving the docker CLI.
    pub fn docker(compose_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(DockerCompose::default()), compose_dir)
    }

    /// Sets the prefix for generated project names.
    pub fn with_project_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.project_prefix = prefix.into();
        self
    }

    /// Directory holding `<name>.yml` compose files.
    pub fn compose_dir(&self) -> &Path {
        &self.compose_dir
    }

    /// Creates (but does not start) the environment described by `<name>.yml`.
    pub fn create(&self, name: &str) -> Result<Environment, EnvironmentError> {
        let file = self.compose_dir.join(format!("{name}.yml"));
        if !file.is_file() {
            return Err(EnvironmentError::ComposeFileMissing {
                name: name.to_string(),
                path: file,
            });
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let project = ComposeProject {
            name: format!("{}-{}-{}", self.project_prefix, name, &suffix[..8]),
            file,
        };
        debug!(environment = name, project = %project.name, "created environment");

        Ok(Environment {
            name: name.to_string(),
            project,
            state: EnvironmentState::Created,
            engine: self.engine.clone(),
        })
    }

    /// Starts `environment`; see [`Environment::start`].
    pub async fn start(&self, environment: &mut Environment) -> Result<(), EnvironmentError> {
        environment.start().await
    }

    /// Stops `environment`; see [`Environment::stop`].
    pub async fn stop(&self, environment: &mut Environment) -> Result<(), EnvironmentError> {
        environment.stop().await
    }

    /// Resolves `service` to its addresses; see [`Environment::lookup`].
    pub async fn lookup(
        &self,
        environment: &Environment,
        service: &str,
    ) -> Result<Vec<String>, EnvironmentError> {
        environment.lookup(service).await
    }
}
