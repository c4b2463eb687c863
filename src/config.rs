//! Settings for a complete sandagent setup
//!
//! [`Settings`] bundles the provider, agent and sandbox configuration and
//! knows how to turn them into a ready [`AgentController`]. Credentials are
//! resolved here, once, into the immutable [`ProviderConfig`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentConfig, AgentController};
use crate::provider::{build_provider, validate_base_url, ProviderConfig, ProviderError};
use crate::sandbox::{
    DockerConfig, DockerSandbox, ProcessSandbox, ProcessSandboxConfig, ResourceLimits,
    SandboxError, SandboxManager,
};

/// Which sandbox implementation to run code in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SandboxBackend {
    Docker,
    Process,
    /// Docker when the daemon answers, local processes otherwise
    #[default]
    Auto,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Everything needed to build an [`AgentController`]
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub provider: ProviderConfig,
    pub agent: AgentConfig,
    pub backend: SandboxBackend,
    pub docker: DockerConfig,
    pub process: ProcessSandboxConfig,
}

impl Settings {
    /// Apply the same limits to the agent and both backends
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.agent.limits = limits.clone();
        self.docker.limits = limits.clone();
        self.process.limits = limits;
        self
    }

    /// Resolve the API key and check the endpoint
    pub fn resolved_provider(&self) -> Result<ProviderConfig, ProviderError> {
        validate_base_url(&self.provider.base_url)?;
        self.provider.clone().resolve_api_key()
    }

    /// Pick a sandbox and check that it is usable
    pub async fn select_sandbox(&self) -> Result<Arc<dyn SandboxManager>, SandboxError> {
        match self.backend {
            SandboxBackend::Docker => {
                let sandbox = DockerSandbox::new(self.docker.clone());
                sandbox.preflight().await?;
                Ok(Arc::new(sandbox))
            }
            SandboxBackend::Process => {
                let sandbox = ProcessSandbox::new(self.process.clone());
                sandbox.preflight().await?;
                Ok(Arc::new(sandbox))
            }
            SandboxBackend::Auto => {
                let docker = DockerSandbox::new(self.docker.clone());
                match docker.preflight().await {
                    Ok(()) => {
                        info!(image = %self.docker.image, "Using Docker sandbox");
                        Ok(Arc::new(docker))
                    }
                    Err(e) => {
                        warn!(error = %e, "Docker unavailable, falling back to process sandbox");
                        let sandbox = ProcessSandbox::new(self.process.clone());
                        sandbox.preflight().await?;
                        Ok(Arc::new(sandbox))
                    }
                }
            }
        }
    }

    /// Build a controller over the given sandbox
    pub fn build_controller(
        &self,
        sandbox: Arc<dyn SandboxManager>,
    ) -> Result<AgentController, ConfigError> {
        let provider = build_provider(self.resolved_provider()?)?;
        Ok(AgentController::new(provider, sandbox, self.agent.clone()))
    }
}
