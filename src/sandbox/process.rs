//! Local process sandbox
//!
//! Each session owns a private working directory under the sandbox root.
//! Every execution is a fresh interpreter process:
//!
//! ```text
//! <root>/sandagent-<session>/        ← cwd, HOME and TMPDIR of the child
//!
//! child (own process group)
//!   ├── env cleared, fixed PATH
//!   ├── cgroup sandagent/<name>              (when cgroups are enabled)
//!   ├── user/mount/PID namespaces            (when confinement is enabled)
//!   ├── RLIMIT_AS / RLIMIT_CPU
//!   └── seccomp: socket(AF_INET*) → EPERM   (when network is disabled)
//! ```
//!
//! Confinement hides the sandbox root and `/tmp` behind empty tmpfs mounts
//! and binds only the session's own directory back, so one session cannot
//! see or signal another. See [`super::confine`].
//!
//! On timeout, or when the execution future is dropped, the whole process
//! group is killed with SIGKILL, so anything the code forked goes with it.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use seccompiler::BpfProgram;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cgroups::CgroupManager;
use super::confine::{self, Confinement};
use super::hardening::{self, NetworkSeccomp};
use super::output::{read_capped, OutputBuffer};
use super::{
    ExecutionResult, ResourceLimits, SandboxError, SandboxManager, SandboxSession,
    TIMEOUT_EXIT_CODE,
};
use crate::conversation::SessionId;
use crate::interpreter::Language;
use crate::metrics::{SANDBOXES_ACTIVE, SANDBOX_PROVISION_DURATION};

/// PATH given to sandboxed children
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const BACKEND: &str = "process";

/// Configuration for [`ProcessSandbox`]
#[derive(Debug, Clone)]
pub struct ProcessSandboxConfig {
    /// Directory holding one working directory per session
    pub root: PathBuf,
    /// Limits recorded on new sessions
    pub limits: ResourceLimits,
    /// Put each session in its own cgroup (needs root or delegation)
    pub use_cgroups: bool,
    /// Run children in their own user, mount and PID namespaces
    pub confine: bool,
    pub python_bin: String,
    pub bash_bin: String,
    pub node_bin: String,
}

impl Default for ProcessSandboxConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("sandagent"),
            limits: ResourceLimits::default(),
            use_cgroups: false,
            confine: true,
            python_bin: "python3".to_string(),
            bash_bin: "bash".to_string(),
            node_bin: "node".to_string(),
        }
    }
}

impl ProcessSandboxConfig {
    /// Program and inline-code flag for a language
    fn interpreter(&self, language: Language) -> (&str, &str) {
        match language {
            Language::Python => (self.python_bin.as_str(), "-c"),
            Language::Bash => (self.bash_bin.as_str(), "-c"),
            Language::JavaScript => (self.node_bin.as_str(), "-e"),
        }
    }
}

struct ProcessEnv {
    session: SandboxSession,
    workdir: PathBuf,
}

/// Sandbox backed by local processes
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
    sessions: Mutex<HashMap<SessionId, ProcessEnv>>,
    cgroups: Option<CgroupManager>,
    network_filter: Option<Arc<BpfProgram>>,
}

impl ProcessSandbox {
    pub fn new(mut config: ProcessSandboxConfig) -> Self {
        if config.root.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                config.root = cwd.join(&config.root);
            }
        }

        let cgroups = if config.use_cgroups {
            match CgroupManager::new() {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!(error = %e, "cgroups unavailable, continuing with rlimits only");
                    None
                }
            }
        } else {
            None
        };

        let network_filter = match NetworkSeccomp::new().build() {
            Ok(program) => Some(Arc::new(program)),
            Err(e) => {
                warn!(error = %e, "Could not build network seccomp filter");
                None
            }
        };

        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            cgroups,
            network_filter,
        }
    }

    pub fn config(&self) -> &ProcessSandboxConfig {
        &self.config
    }

    /// Run a trivial confined child to prove namespaces are usable here
    async fn check_confinement(&self) -> Result<(), SandboxError> {
        let workdir = self.config.root.join(".preflight");
        create_private_dir(&workdir)
            .await
            .map_err(|e| SandboxError::provision_with("cannot create preflight directory", e))?;

        let limits = self.config.limits.clone().with_network(true);
        let outcome = match self.build_command(&workdir, None, "exit 0", Language::Bash, &limits) {
            Ok(mut command) => command.output().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let _ = remove_dir_if_exists(&workdir).await;

        match outcome {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(SandboxError::provision(format!(
                "namespace confinement check exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Err(e) => Err(SandboxError::provision(format!(
                "namespace confinement is unavailable ({}); disable it with --no-confine",
                e
            ))),
        }
    }

    /// Working directory of a live session
    pub async fn workdir(&self, session_id: &SessionId) -> Option<PathBuf> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|env| env.workdir.clone())
    }

    fn build_command(
        &self,
        workdir: &Path,
        cgroup: Option<&str>,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<Command, SandboxError> {
        let (program, flag) = self.config.interpreter(language);

        let filter = if limits.network_disabled {
            Some(self.network_filter.clone().ok_or_else(|| {
                SandboxError::execution("network isolation requested but seccomp is unavailable")
            })?)
        } else {
            None
        };
        // V8 reserves far more address space than it touches
        let address_space = (language != Language::JavaScript).then_some(limits.memory_bytes);
        let cpu_seconds = limits.cpu_seconds();

        let confinement = if self.config.confine {
            Some(Confinement::prepare(&self.config.root, workdir).map_err(|e| {
                SandboxError::execution_with("cannot prepare namespace confinement", e)
            })?)
        } else {
            None
        };
        let cgroup_procs = match (&self.cgroups, cgroup) {
            (Some(cgroups), Some(name)) => {
                let procs = cgroups.procs_path(name);
                Some(CString::new(procs.as_os_str().as_bytes()).map_err(|e| {
                    SandboxError::execution_with("invalid cgroup path", e)
                })?)
            }
            _ => None,
        };

        let mut command = Command::new(program);
        command
            .arg(flag)
            .arg(code)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        // SAFETY: the closure only issues syscalls on data prepared before
        // fork; nothing allocates on the success path.
        unsafe {
            command.pre_exec(move || {
                // Before unshare, while the cgroup tree is still writable;
                // anything forked later inherits it
                if let Some(procs) = &cgroup_procs {
                    confine::join_cgroup(procs);
                }
                if let Some(confinement) = &confinement {
                    confinement.enter()?;
                }
                if let Some(bytes) = address_space {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io::Error::from)?;
                }
                setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)
                    .map_err(io::Error::from)?;
                if let Some(program) = &filter {
                    hardening::apply(program)?;
                }
                Ok(())
            });
        }
        Ok(command)
    }
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // ESRCH just means the group is already gone
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

/// Kills a child's process group when dropped
///
/// `kill_on_drop` only reaches the direct child; this takes the grandchildren
/// along when an execution future is cancelled mid-flight.
struct GroupGuard(Option<u32>);

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.0);
    }
}

async fn join_output(
    task: JoinHandle<io::Result<OutputBuffer>>,
) -> Result<OutputBuffer, SandboxError> {
    task.await
        .map_err(|e| SandboxError::execution_with("output reader task failed", e))?
        .map_err(|e| SandboxError::execution_with("failed to read child output", e))
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn create_private_dir(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

#[async_trait]
impl SandboxManager for ProcessSandbox {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn preflight(&self) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(&self.config.root)
            .await
            .map_err(|e| {
                SandboxError::provision_with(
                    format!("sandbox root {} is not writable", self.config.root.display()),
                    e,
                )
            })?;
        if self.config.limits.network_disabled && self.network_filter.is_none() {
            return Err(SandboxError::provision(
                "network isolation requested but the seccomp filter could not be built",
            ));
        }
        if self.config.confine {
            self.check_confinement().await?;
        }
        debug!(
            root = %self.config.root.display(),
            confine = self.config.confine,
            "Process sandbox preflight passed"
        );
        Ok(())
    }

    async fn acquire(&self, session_id: &SessionId) -> Result<SandboxSession, SandboxError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(env) = sessions.get(session_id) {
            return Ok(env.session.clone());
        }

        let start = Instant::now();
        let session = SandboxSession::new(session_id, self.config.limits.clone());
        let workdir = self.config.root.join(&session.name);

        create_private_dir(&workdir).await.map_err(|e| {
            SandboxError::provision_with(format!("cannot create {}", workdir.display()), e)
        })?;

        if let Some(cgroups) = &self.cgroups {
            if let Err(e) = cgroups.create(&session.name, &session.limits) {
                warn!(sandbox = %session.name, error = %e, "Failed to create cgroup");
            }
        }

        SANDBOXES_ACTIVE.with_label_values(&[BACKEND]).inc();
        SANDBOX_PROVISION_DURATION
            .with_label_values(&[BACKEND])
            .observe(start.elapsed().as_secs_f64());
        info!(sandbox = %session.name, workdir = %workdir.display(), "Sandbox provisioned");

        sessions.insert(
            session_id.clone(),
            ProcessEnv {
                session: session.clone(),
                workdir,
            },
        );
        Ok(session)
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        let workdir = self
            .workdir(&session.session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(session.session_id.clone()))?;
        let invocation = session.next_invocation();

        let cgroup = self.cgroups.as_ref().map(|_| session.name.as_str());
        let mut command = self.build_command(&workdir, cgroup, code, language, limits)?;
        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SandboxError::UnsupportedLanguage(language))
            }
            Err(e) => return Err(SandboxError::execution_with("failed to spawn interpreter", e)),
        };
        let pid = child.id();
        let _group = GroupGuard(pid);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::execution("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::execution("child stderr was not captured"))?;
        let stdout_task = tokio::spawn(read_capped(stdout, limits.output_limit_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr, limits.output_limit_bytes));

        let (status, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
            Ok(status) => (status, false),
            Err(_) => {
                kill_group(pid);
                (child.wait().await, true)
            }
        };
        let status =
            status.map_err(|e| SandboxError::execution_with("failed to wait for child", e))?;
        let duration = started.elapsed();

        // Background children still holding the pipes
        kill_group(pid);

        let stdout = join_output(stdout_task).await?;
        let stderr = join_output(stderr_task).await?;

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            status
                .code()
                .or_else(|| status.signal().map(|signal| 128 + signal))
                .unwrap_or(-1)
        };
        let truncated = stdout.is_truncated() || stderr.is_truncated();

        debug!(
            sandbox = %session.name,
            invocation,
            %language,
            exit_code,
            timed_out,
            truncated,
            duration_ms = duration.as_secs_f64() * 1000.0,
            "Process execution finished"
        );

        Ok(ExecutionResult {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code,
            duration,
            truncated,
            timed_out,
        })
    }

    async fn reset(&self, session: &SandboxSession) -> Result<(), SandboxError> {
        let workdir = self
            .workdir(&session.session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(session.session_id.clone()))?;

        if let Some(cgroups) = &self.cgroups {
            if let Err(e) = cgroups.kill_all(&session.name) {
                warn!(sandbox = %session.name, error = %e, "Failed to kill cgroup processes");
            }
        }
        remove_dir_if_exists(&workdir)
            .await
            .map_err(|e| SandboxError::provision_with("failed to wipe sandbox directory", e))?;
        create_private_dir(&workdir)
            .await
            .map_err(|e| SandboxError::provision_with("failed to recreate sandbox directory", e))?;

        info!(sandbox = %session.name, "Sandbox reset");
        Ok(())
    }

    async fn release(&self, session: SandboxSession) -> Result<(), SandboxError> {
        let env = self
            .sessions
            .lock()
            .await
            .remove(&session.session_id)
            .ok_or_else(|| SandboxError::NotFound(session.session_id.clone()))?;
        SANDBOXES_ACTIVE.with_label_values(&[BACKEND]).dec();

        if let Some(cgroups) = &self.cgroups {
            if let Err(e) = cgroups.kill_all(&session.name).and_then(|_| cgroups.destroy(&session.name)) {
                warn!(sandbox = %session.name, error = %e, "Failed to remove cgroup");
            }
        }

        remove_dir_if_exists(&env.workdir).await.map_err(|e| {
            SandboxError::provision_with(format!("failed to remove {}", env.workdir.display()), e)
        })?;

        info!(
            sandbox = %session.name,
            executions = session.invocations(),
            "Sandbox released"
        );
        Ok(())
    }
}
