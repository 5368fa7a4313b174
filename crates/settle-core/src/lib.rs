//! # settle-core
//!
//! Building blocks for tests that wait on eventually-consistent systems.
//!
//! This crate provides:
//! - A bounded retry executor ([`Poller`]) that reports the last failure cause
//! - HTTP probes usable as poll actions ([`HttpProbe`])
//! - Subprocess supervision with continuous output capture ([`ProcessSupervisor`])
//! - Multi-container environment lifecycle and service lookup ([`EnvironmentController`])
//! - Config templating to temporary files ([`ConfigTemplater`])
//! - The orchestrator capability and its Marathon client ([`Orchestrator`])
//! - Output-on-failure reporting ([`DiagnosticReporter`])

pub mod config;
pub mod diagnostics;
pub mod environment;
pub mod orchestrator;
pub mod poller;
pub mod probe;
pub mod supervisor;
pub mod template;

pub use config::{
    ConfigError, EnvironmentConfig, HarnessConfig, OrchestratorConfig, PollingConfig, ProxyConfig,
};
pub use diagnostics::{DiagnosticReporter, ReportGuard};
pub use environment::{
    ComposeProject, ContainerDetails, ContainerEngine, DockerCompose, Environment,
    EnvironmentController, EnvironmentError, EnvironmentState, NetworkAttachment,
};
pub use orchestrator::{
    DeploymentId, MarathonClient, MarathonConnector, Orchestrator, OrchestratorError,
    OrchestratorFactory, WorkloadSpec,
};
pub use poller::{DEFAULT_INTERVAL, PollError, Poller, RetryPolicy};
pub use probe::{HttpProbe, ProbeError, ResponseCheck, StatusCodeIs, get_request, status_code_is};
pub use supervisor::{OutputBuffer, ProcessHandle, ProcessSpec, ProcessSupervisor, SupervisorError};
pub use template::{ConfigTemplater, RenderedConfig, TemplateError, TemplateValues};
