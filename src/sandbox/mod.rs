//! Sandbox lifecycle management
//!
//! A [`SandboxManager`] provisions one isolated environment per agent
//! session, runs model-written code in it, and tears it down.
//!
//! ```text
//!  acquire(session) ──▶ SandboxSession "sandagent-<session id>"
//!        │                    │
//!        │          execute(code) ──▶ ExecutionResult (timeout and
//!        │                    │        non-zero exit are results)
//!        │          reset() ──┘ fresh environment, same name
//!        ▼
//!  release(session)  exactly once, on every exit path (see SandboxLease)
//! ```
//!
//! Two backends are provided:
//!
//! - [`DockerSandbox`] - one long-lived container per session, driven over
//!   the Docker Engine API on the local Unix socket
//! - [`ProcessSandbox`] - a private working directory and process group per
//!   session, with rlimits, an optional network-deny seccomp filter and
//!   optional cgroups v2 limits

pub mod cgroups;
pub mod confine;
pub mod docker;
pub mod hardening;
pub mod lease;
pub mod limits;
pub mod output;
pub mod process;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::SessionId;
use crate::interpreter::Language;

pub use docker::{DockerConfig, DockerSandbox};
pub use lease::SandboxLease;
pub use limits::ResourceLimits;
pub use process::{ProcessSandbox, ProcessSandboxConfig};

/// Exit code reported for executions killed at the wall-clock limit
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Prefix of every sandbox environment name
pub const ENVIRONMENT_PREFIX: &str = "sandagent-";

/// Outcome of one code execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    /// stdout or stderr hit the output ceiling
    pub truncated: bool,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Metric label: "success", "error" or "timeout"
    pub fn status(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.exit_code == 0 {
            "success"
        } else {
            "error"
        }
    }

    /// Text fed back to the model
    pub fn render(&self) -> String {
        let mut text = format!(
            "Exit code: {}\nStdout:\n{}\nStderr:\n{}",
            self.exit_code, self.stdout, self.stderr
        );
        if self.truncated {
            text.push_str("\n(Output truncated)");
        }
        if self.timed_out {
            text.push_str(&format!(
                "\n(Execution timed out after {:.1}s)",
                self.duration.as_secs_f64()
            ));
        }
        text
    }
}

/// Handle to a live sandbox environment
///
/// Clones share the invocation counter. The name is stable for the life of
/// the session, across resets.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    pub name: String,
    pub session_id: SessionId,
    pub limits: ResourceLimits,
    pub created_at: SystemTime,
    invocations: Arc<AtomicU64>,
}

impl SandboxSession {
    pub fn new(session_id: &SessionId, limits: ResourceLimits) -> Self {
        Self {
            name: environment_name(session_id),
            session_id: session_id.clone(),
            limits,
            created_at: SystemTime::now(),
            invocations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count one more execution and return its 1-based number
    pub fn next_invocation(&self) -> u64 {
        self.invocations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// Environment name for a session
pub fn environment_name(session_id: &SessionId) -> String {
    format!("{}{}", ENVIRONMENT_PREFIX, session_id)
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for sandbox operations
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The environment could not be created, reset or reached
    #[error("failed to provision sandbox: {message}")]
    Provision {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The runtime failed while running code (not a non-zero exit)
    #[error("sandbox infrastructure failed during execution: {message}")]
    Execution {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// No interpreter for this language in the environment
    #[error("{0} is not available in this sandbox")]
    UnsupportedLanguage(Language),

    #[error("no live sandbox for session {0}")]
    NotFound(SessionId),
}

impl SandboxError {
    pub fn provision(message: impl Into<String>) -> Self {
        SandboxError::Provision {
            message: message.into(),
            source: None,
        }
    }

    pub fn provision_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SandboxError::Provision {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        SandboxError::Execution {
            message: message.into(),
            source: None,
        }
    }

    pub fn execution_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SandboxError::Execution {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Provisions, drives and tears down per-session execution environments
#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Backend name for logs and metrics
    fn name(&self) -> &str;

    /// Check that the runtime is usable before any session starts
    async fn preflight(&self) -> Result<(), SandboxError>;

    /// Create the session's environment, or return the live one
    async fn acquire(&self, session_id: &SessionId) -> Result<SandboxSession, SandboxError>;

    /// Run `code` under `limits`
    ///
    /// A timeout or non-zero exit is an `Ok` result; `Err` means the
    /// environment itself failed.
    async fn execute(
        &self,
        session: &SandboxSession,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Replace the environment with a fresh one under the same name
    async fn reset(&self, session: &SandboxSession) -> Result<(), SandboxError>;

    /// Tear the environment down
    async fn release(&self, session: SandboxSession) -> Result<(), SandboxError>;
}
