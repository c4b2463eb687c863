//! Docker-backed sandbox
//!
//! One long-lived container per session, named after the session:
//!
//! ```text
//! acquire ──► POST /containers/create?name=sandagent-<id>   (sleep infinity,
//!        └──► POST /containers/{id}/start                     no network)
//!
//! execute ──► POST /containers/{id}/exec   timeout -s KILL <secs> python -c <code>
//!        ├──► POST /exec/{id}/start        multiplexed stdout/stderr
//!        └──► GET  /exec/{id}/json         exit code
//!
//! release ──► DELETE /containers/{id}?force=true
//! ```
//!
//! Files written under the working directory persist between executions of
//! the same session. Interpreter state does not: every execution is a new
//! process.
//!
//! Each session has its own slot. The session map is only locked to look a
//! slot up, so a slow container create or reset for one session never
//! stalls the others.

pub mod api;
pub mod client;
pub mod stream;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::BodyExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use self::api::{ContainerCreate, ExecCreate, HostConfig};
use self::client::{DockerClient, DockerError, DEFAULT_DOCKER_SOCKET};
use self::stream::ExecStreamDemuxer;
use super::{
    ExecutionResult, ResourceLimits, SandboxError, SandboxManager, SandboxSession,
    TIMEOUT_EXIT_CODE,
};
use crate::conversation::SessionId;
use crate::interpreter::Language;
use crate::metrics::{SANDBOXES_ACTIVE, SANDBOX_PROVISION_DURATION};

const BACKEND: &str = "docker";

/// Extra time given to the exec stream past the in-container timeout
const EXEC_GRACE: Duration = Duration::from_secs(5);

/// Exit status of `timeout` when the command could not be found
const COMMAND_NOT_FOUND: i32 = 127;

/// Exit status of a SIGKILLed process
const KILLED: i32 = 128 + 9;

/// Configuration for [`DockerSandbox`]
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub socket_path: PathBuf,
    pub image: String,
    /// Pull the image during preflight when it is not present
    pub pull_if_missing: bool,
    /// Working directory inside the container
    pub workdir: String,
    /// Limits applied to new containers
    pub limits: ResourceLimits,
    /// Interpreter argv prefix per language; the code is appended
    pub interpreters: HashMap<Language, Vec<String>>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let mut interpreters = HashMap::new();
        interpreters.insert(Language::Python, vec!["python".to_string(), "-c".to_string()]);
        interpreters.insert(Language::Bash, vec!["bash".to_string(), "-c".to_string()]);

        Self {
            socket_path: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            image: "python:3.10-slim".to_string(),
            pull_if_missing: true,
            workdir: "/workspace".to_string(),
            limits: ResourceLimits::default(),
            interpreters,
        }
    }
}

impl DockerConfig {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Container spec for a session
    pub fn container_spec(&self, session: &SandboxSession) -> ContainerCreate {
        let limits = &session.limits;
        let mut labels = HashMap::new();
        labels.insert("sandagent.session".to_string(), session.session_id.to_string());

        ContainerCreate {
            image: self.image.clone(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            working_dir: self.workdir.clone(),
            network_disabled: limits.network_disabled,
            labels,
            host_config: HostConfig {
                memory: limits.memory_bytes as i64,
                memory_swap: limits.memory_bytes as i64,
                nano_cpus: limits.nano_cpus(),
                pids_limit: limits.pids_limit as i64,
                network_mode: if limits.network_disabled { "none" } else { "bridge" }.to_string(),
                cap_drop: vec!["ALL".to_string()],
                security_opt: vec!["no-new-privileges".to_string()],
                readonly_rootfs: false,
                tmpfs: HashMap::new(),
            },
        }
    }

    /// Full exec argv: the interpreter wrapped in coreutils `timeout`
    pub fn exec_command(
        &self,
        code: &str,
        language: Language,
        timeout: Duration,
    ) -> Option<Vec<String>> {
        let interpreter = self.interpreters.get(&language)?;
        let mut cmd = vec![
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            format!("{}", timeout.as_secs_f64()),
        ];
        cmd.extend(interpreter.iter().cloned());
        cmd.push(code.to_string());
        Some(cmd)
    }
}

struct DockerEnv {
    session: SandboxSession,
    container_id: String,
}

/// Per-session state; empty until the container is up
type Slot = Arc<Mutex<Option<DockerEnv>>>;

/// Sandbox backed by Docker containers
pub struct DockerSandbox {
    client: DockerClient,
    config: DockerConfig,
    containers: Mutex<HashMap<SessionId, Slot>>,
}

impl DockerSandbox {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            client: DockerClient::new(config.socket_path.clone()),
            config,
            containers: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, session_id: &SessionId) -> Option<Slot> {
        self.containers.lock().await.get(session_id).cloned()
    }

    async fn slot_or_insert(&self, session_id: &SessionId) -> Slot {
        self.containers
            .lock()
            .await
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    /// Drop a slot whose acquisition failed, unless it was replaced meanwhile
    async fn forget(&self, session_id: &SessionId, slot: &Slot) {
        let mut containers = self.containers.lock().await;
        if containers
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            containers.remove(session_id);
        }
    }

    async fn container_id(&self, session_id: &SessionId) -> Result<String, SandboxError> {
        let not_found = || SandboxError::NotFound(session_id.clone());
        let slot = self.slot(session_id).await.ok_or_else(not_found)?;
        let container_id = slot.lock().await.as_ref().map(|env| env.container_id.clone());
        container_id.ok_or_else(not_found)
    }

    /// Create and start the session container
    ///
    /// A leftover container with the same name (from a crashed run) is
    /// removed first.
    async fn create_environment(&self, session: &SandboxSession) -> Result<String, DockerError> {
        let spec = self.config.container_spec(session);
        let id = match self.client.create_container(&session.name, &spec).await {
            Err(e) if e.status() == Some(409) => {
                warn!(sandbox = %session.name, "Removing stale container with the same name");
                self.client.remove_container(&session.name).await?;
                self.client.create_container(&session.name, &spec).await?
            }
            other => other?,
        };

        if let Err(e) = self.client.start_container(&id).await {
            let _ = self.client.remove_container(&id).await;
            return Err(e);
        }
        Ok(id)
    }
}

#[async_trait]
impl SandboxManager for DockerSandbox {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn preflight(&self) -> Result<(), SandboxError> {
        self.client.ping().await.map_err(|e| {
            SandboxError::provision_with(
                format!(
                    "Docker daemon not reachable at {}",
                    self.client.socket_path().display()
                ),
                e,
            )
        })?;

        let present = self
            .client
            .image_exists(&self.config.image)
            .await
            .map_err(|e| SandboxError::provision_with("failed to inspect image", e))?;
        if present {
            return Ok(());
        }
        if !self.config.pull_if_missing {
            return Err(SandboxError::provision(format!(
                "image {} is not present",
                self.config.image
            )));
        }

        info!(image = %self.config.image, "Pulling sandbox image");
        self.client
            .pull_image(&self.config.image)
            .await
            .map_err(|e| SandboxError::provision_with("failed to pull image", e))?;

        match self.client.image_exists(&self.config.image).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SandboxError::provision(format!(
                "image {} still missing after pull",
                self.config.image
            ))),
            Err(e) => Err(SandboxError::provision_with("failed to inspect image", e)),
        }
    }

    async fn acquire(&self, session_id: &SessionId) -> Result<SandboxSession, SandboxError> {
        let slot = self.slot_or_insert(session_id).await;
        let mut env = slot.lock().await;
        if let Some(env) = env.as_ref() {
            return Ok(env.session.clone());
        }

        let start = Instant::now();
        let session = SandboxSession::new(session_id, self.config.limits.clone());
        let container_id = match self.create_environment(&session).await {
            Ok(id) => id,
            Err(e) => {
                drop(env);
                self.forget(session_id, &slot).await;
                return Err(SandboxError::provision_with(
                    format!("failed to start container {}", session.name),
                    e,
                ));
            }
        };

        SANDBOXES_ACTIVE.with_label_values(&[BACKEND]).inc();
        SANDBOX_PROVISION_DURATION
            .with_label_values(&[BACKEND])
            .observe(start.elapsed().as_secs_f64());
        info!(
            sandbox = %session.name,
            container = %container_id,
            image = %self.config.image,
            "Sandbox provisioned"
        );

        *env = Some(DockerEnv {
            session: session.clone(),
            container_id,
        });
        Ok(session)
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        let container_id = self.container_id(&session.session_id).await?;
        let cmd = self
            .config
            .exec_command(code, language, limits.timeout)
            .ok_or(SandboxError::UnsupportedLanguage(language))?;
        let invocation = session.next_invocation();

        let exec_id = self
            .client
            .create_exec(
                &container_id,
                &ExecCreate {
                    attach_stdin: false,
                    attach_stdout: true,
                    attach_stderr: true,
                    tty: false,
                    working_dir: self.config.workdir.clone(),
                    cmd,
                },
            )
            .await
            .map_err(|e| SandboxError::execution_with("failed to create exec", e))?;

        let started = Instant::now();
        let mut body = self
            .client
            .start_exec(&exec_id)
            .await
            .map_err(|e| SandboxError::execution_with("failed to start exec", e))?;

        let mut demuxer = ExecStreamDemuxer::new(limits.output_limit_bytes);
        let read = async {
            while let Some(frame) = body.frame().await {
                if let Ok(data) = frame?.into_data() {
                    demuxer.push(&data);
                }
            }
            Ok::<(), hyper::Error>(())
        };
        let stream_timed_out = match tokio::time::timeout(limits.timeout + EXEC_GRACE, read).await
        {
            Ok(Ok(())) => false,
            Ok(Err(e)) => return Err(SandboxError::execution_with("exec stream failed", e)),
            Err(_) => true,
        };
        let duration = started.elapsed();

        let inspect = self
            .client
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| SandboxError::execution_with("failed to inspect exec", e))?;
        let raw_exit = inspect.exit_code.unwrap_or(-1) as i32;

        let (stdout, stderr) = demuxer.finish();
        let truncated = stdout.is_truncated() || stderr.is_truncated();
        let stdout = stdout.into_string();
        let stderr = stderr.into_string();

        if raw_exit == COMMAND_NOT_FOUND && stderr.starts_with("timeout:") {
            return Err(SandboxError::UnsupportedLanguage(language));
        }

        let timed_out = stream_timed_out
            || inspect.running
            || raw_exit == TIMEOUT_EXIT_CODE
            || (raw_exit == KILLED && duration >= limits.timeout);
        let exit_code = if timed_out { TIMEOUT_EXIT_CODE } else { raw_exit };

        debug!(
            sandbox = %session.name,
            invocation,
            %language,
            exit_code,
            timed_out,
            truncated,
            duration_ms = duration.as_secs_f64() * 1000.0,
            "Docker execution finished"
        );

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            duration,
            truncated,
            timed_out,
        })
    }

    async fn reset(&self, session: &SandboxSession) -> Result<(), SandboxError> {
        let not_found = || SandboxError::NotFound(session.session_id.clone());
        let slot = self.slot(&session.session_id).await.ok_or_else(not_found)?;
        let mut guard = slot.lock().await;
        let env = guard.as_mut().ok_or_else(not_found)?;

        self.client
            .remove_container(&env.container_id)
            .await
            .map_err(|e| SandboxError::provision_with("failed to remove container for reset", e))?;
        env.container_id = self
            .create_environment(&env.session)
            .await
            .map_err(|e| SandboxError::provision_with("failed to recreate container", e))?;

        info!(sandbox = %session.name, container = %env.container_id, "Sandbox reset");
        Ok(())
    }

    async fn release(&self, session: SandboxSession) -> Result<(), SandboxError> {
        let not_found = || SandboxError::NotFound(session.session_id.clone());
        let slot = self
            .containers
            .lock()
            .await
            .remove(&session.session_id)
            .ok_or_else(not_found)?;
        // Waits out an acquire or reset still in flight
        let env = slot.lock().await.take().ok_or_else(not_found)?;
        SANDBOXES_ACTIVE.with_label_values(&[BACKEND]).dec();

        self.client
            .remove_container(&env.container_id)
            .await
            .map_err(|e| {
                SandboxError::provision_with(format!("failed to remove container {}", session.name), e)
            })?;

        info!(
            sandbox = %session.name,
            executions = session.invocations(),
            "Sandbox released"
        );
        Ok(())
    }
}
