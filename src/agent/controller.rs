//! Agent Controller - main orchestration loop for LLM-driven code execution
//!
//! One run drives one session:
//!
//! ```text
//! Idle → AwaitingModel → Interpreting ─┬─ Execute ──► Executing ──► AwaitingModel
//!                                      ├─ Narrate ──► AwaitingModel (clarification)
//!                                      └─ Finish  ──► Finished
//!                       … → Terminal(Success | BudgetExhausted | Fatal)
//! ```
//!
//! The sandbox is acquired lazily on the first `Execute` and held in a
//! [`SandboxLease`]. Whatever ends the run (an answer, an exhausted budget,
//! an error, cancellation or a panic inside the loop), the lease is
//! finished exactly once before the run returns. Acquisition runs as its own
//! task, so a run cancelled while the environment is being provisioned still
//! waits for it and releases it.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::budget::{Budget, BudgetTracker, Exhaustion};
use super::retry::{RetryExhausted, RetryPolicy};
use crate::conversation::{ActionKind, Conversation, ConversationError, Role, SessionId, Turn};
use crate::interpreter::{self, Action, Language};
use crate::metrics::{
    AGENT_SESSIONS, AGENT_TURNS, CODE_EXECUTIONS, CODE_EXECUTION_DURATION, LLM_CALL_DURATION,
};
use crate::provider::{ChatProvider, ModelResponse, ProviderError};
use crate::sandbox::{
    ExecutionResult, ResourceLimits, SandboxError, SandboxLease, SandboxManager, SandboxSession,
};

/// System prompt teaching the model the response protocol
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a careful assistant that solves tasks by writing and running code.

To run code, reply with exactly one fenced code block tagged with its language, \
for example:

```python
print(2 + 2)
```

Supported languages are python, bash and javascript. You will receive the exit \
code, stdout and stderr of the block in the next message. Files you write stay \
available for the rest of the task, but variables do not carry over between \
blocks. To start again from an empty working directory, make the first line of \
the block `# sandagent: reset`.

When the task is complete, give your final answer and end with a line \
containing only FINISH. Never run code and finish in the same reply.";

/// Sent when a response neither runs code nor finishes
pub const CLARIFICATION_PROMPT: &str = "\
Your last reply neither ran code nor finished. Reply with one fenced code block \
to run code, or give your final answer followed by a line containing only FINISH.";

/// Execution result used when running code is switched off
pub const EXECUTION_DISABLED_NOTICE: &str = "\
Code execution is disabled for this session. The code was not run. Answer from \
reasoning alone and end with FINISH.";

/// Answer of a run that produced no usable text
pub const NO_ANSWER_NOTICE: &str = "The agent stopped before producing an answer.";

/// Prompt asking the model to revisit its first final answer
pub fn reflection_prompt(last_output: &str) -> String {
    format!(
        "Please reflect on your last output, which was '{}'. \
         If you can improve it, please do so and provide a new response.",
        last_output
    )
}

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub budget: Budget,
    /// Limits for every execution in the session
    pub limits: ResourceLimits,
    pub retry: RetryPolicy,
    /// Deadline for a single model call
    pub provider_timeout: Duration,
    /// Ask the model to reflect once on its first final answer
    pub reflect: bool,
    /// Run code; when off, Execute actions get a notice and no sandbox is used
    pub execute_code: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            budget: Budget::default(),
            limits: ResourceLimits::default(),
            retry: RetryPolicy::default(),
            provider_timeout: Duration::from_secs(120),
            reflect: false,
            execute_code: true,
        }
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    Interpreting,
    Executing,
    Finished,
    Terminal,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::Interpreting => "interpreting",
            LoopState::Executing => "executing",
            LoopState::Finished => "finished",
            LoopState::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Outcome {
    Success,
    BudgetExhausted(Exhaustion),
    Fatal(AgentError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Process exit code: 0 success, 2 budget exhausted, 1 fatal
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::BudgetExhausted(_) => 2,
            Outcome::Fatal(_) => 1,
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::BudgetExhausted(_) => "budget_exhausted",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// Record of a single code execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub language: Language,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: f64,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ExecutionRecord {
    fn new(language: Language, code: &str, result: &ExecutionResult) -> Self {
        Self {
            language,
            code: code.to_string(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            duration_ms: result.duration.as_secs_f64() * 1000.0,
            timed_out: result.timed_out,
            truncated: result.truncated,
        }
    }
}

/// Result of an agent run
#[derive(Debug)]
pub struct AgentRun {
    pub session_id: SessionId,
    pub outcome: Outcome,
    /// Final answer, or the best partial answer; never empty
    pub answer: String,
    pub turns_used: usize,
    pub executions: Vec<ExecutionRecord>,
    /// Frozen transcript
    pub conversation: Conversation,
    pub duration: Duration,
}

impl AgentRun {
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }
}

/// Error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider failed after {attempts} attempt(s): {source}")]
    Provider {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("failed to provision sandbox: {0}")]
    SandboxProvision(#[source] SandboxError),

    #[error("sandbox failed: {0}")]
    SandboxExecution(#[source] SandboxError),

    #[error("conversation rejected a turn: {0}")]
    Conversation(#[from] ConversationError),

    #[error("session cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Which boundary failed: "provider", "sandbox" or "agent"
    pub fn boundary(&self) -> &'static str {
        match self {
            AgentError::Provider { .. } => "provider",
            AgentError::SandboxProvision(_) | AgentError::SandboxExecution(_) => "sandbox",
            AgentError::Conversation(_) | AgentError::Cancelled | AgentError::Internal(_) => {
                "agent"
            }
        }
    }
}

impl From<RetryExhausted> for AgentError {
    fn from(e: RetryExhausted) -> Self {
        AgentError::Provider {
            attempts: e.attempts,
            source: e.error,
        }
    }
}

impl From<SandboxError> for AgentError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Provision { .. } => AgentError::SandboxProvision(e),
            _ => AgentError::SandboxExecution(e),
        }
    }
}

/// Mutable state of one run
struct SessionContext {
    session_id: SessionId,
    conversation: Conversation,
    budget: BudgetTracker,
    lease: Option<SandboxLease>,
    /// Acquisition in flight; always resolves to a lease or an error
    pending_acquire: Option<JoinHandle<Result<SandboxLease, SandboxError>>>,
    executions: Vec<ExecutionRecord>,
    state: LoopState,
    reflected: bool,
    answer: Option<String>,
    last_narration: Option<String>,
}

impl SessionContext {
    fn new(session_id: SessionId, budget: Budget) -> Self {
        Self {
            session_id,
            conversation: Conversation::new(),
            budget: BudgetTracker::new(budget),
            lease: None,
            pending_acquire: None,
            executions: Vec::new(),
            state: LoopState::Idle,
            reflected: false,
            answer: None,
            last_narration: None,
        }
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = %self.state, to = %next, "Loop state transition");
        self.state = next;
    }

    fn note_narration(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.last_narration = Some(text.trim().to_string());
        }
    }

    /// Best available answer: the final one, else the last narration, else
    /// the last assistant text
    fn best_answer(&mut self) -> String {
        self.answer
            .take()
            .filter(|a| !a.trim().is_empty())
            .or_else(|| self.last_narration.clone())
            .or_else(|| {
                self.conversation
                    .iter()
                    .rev()
                    .find(|t| t.role == Role::Assistant && !t.content.trim().is_empty())
                    .map(|t| t.content.trim().to_string())
            })
            .unwrap_or_else(|| NO_ANSWER_NOTICE.to_string())
    }
}

/// Agent Controller orchestrating the model and code execution
pub struct AgentController {
    provider: Arc<dyn ChatProvider>,
    sandbox: Arc<dyn SandboxManager>,
    config: AgentConfig,
}

impl AgentController {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        sandbox: Arc<dyn SandboxManager>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            sandbox,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the agent loop for a given task
    pub async fn run(&self, task: &str) -> AgentRun {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Run the agent loop, stopping early when `cancel` fires
    ///
    /// Cancellation ends the run with `Fatal(Cancelled)` at the next
    /// suspension point; the sandbox is still released before returning.
    pub async fn run_with_cancel(&self, task: &str, cancel: CancellationToken) -> AgentRun {
        let session_id = SessionId::new();

        // Root span for the entire agent task
        let root_span = info_span!(
            "agent_task",
            trace_id = %session_id,
            provider = %self.provider.name(),
            model = %self.provider.model(),
            otel.name = "agent_task"
        );

        self.run_session(session_id, task, cancel)
            .instrument(root_span)
            .await
    }

    async fn run_session(
        &self,
        session_id: SessionId,
        task: &str,
        cancel: CancellationToken,
    ) -> AgentRun {
        let started = Instant::now();
        let mut ctx = SessionContext::new(session_id, self.config.budget);
        info!(task = %task, max_turns = self.config.budget.max_turns, "Starting agent task");

        let outcome = {
            let drive = AssertUnwindSafe(self.drive(&mut ctx, task)).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Fatal(AgentError::Cancelled),
                result = drive => match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => Outcome::Fatal(e),
                    Err(panic) => Outcome::Fatal(AgentError::Internal(panic_message(panic))),
                },
            }
        };
        ctx.transition(LoopState::Terminal);

        if let Some(pending) = ctx.pending_acquire.take() {
            debug!("Waiting for interrupted sandbox acquisition");
            match pending.await {
                Ok(Ok(lease)) => ctx.lease = Some(lease),
                Ok(Err(e)) => debug!(error = %e, "Interrupted acquisition failed"),
                Err(e) => error!(error = %e, "Sandbox acquisition task failed"),
            }
        }
        if let Some(lease) = ctx.lease.take() {
            if let Err(e) = lease.finish().await {
                error!(error = %e, "Failed to release sandbox");
            }
        }
        ctx.conversation.freeze();

        let turns_used = ctx.budget.turns_used();
        AGENT_SESSIONS.with_label_values(&[outcome.label()]).inc();
        AGENT_TURNS.observe(turns_used as f64);

        match &outcome {
            Outcome::Success => {
                info!(turns = turns_used, executions = ctx.executions.len(), "Agent task completed")
            }
            Outcome::BudgetExhausted(exhaustion) => {
                warn!(turns = turns_used, reason = %exhaustion, "Agent task stopped by budget")
            }
            Outcome::Fatal(e) => {
                error!(turns = turns_used, boundary = e.boundary(), error = %e, "Agent task failed")
            }
        }

        AgentRun {
            answer: ctx.best_answer(),
            session_id: ctx.session_id,
            outcome,
            turns_used,
            executions: ctx.executions,
            conversation: ctx.conversation,
            duration: started.elapsed(),
        }
    }

    /// The loop proper; fatal errors come back as `Err`
    async fn drive(&self, ctx: &mut SessionContext, task: &str) -> Result<Outcome, AgentError> {
        ctx.conversation
            .push(Turn::system(self.config.system_prompt.clone()))?;
        ctx.conversation.push(Turn::user(task))?;

        loop {
            let turn = match ctx.budget.try_consume_turn() {
                Ok(turn) => turn,
                Err(exhaustion) => return Ok(Outcome::BudgetExhausted(exhaustion)),
            };

            ctx.transition(LoopState::AwaitingModel);
            let response = match self.call_model(ctx, turn).await {
                Ok(response) => response,
                Err(e) if ctx.budget.remaining_time() == Some(Duration::ZERO) => {
                    warn!(error = %e, "Model call cut short by the time budget");
                    return Ok(Outcome::BudgetExhausted(Exhaustion::WallClock));
                }
                Err(e) => return Err(e),
            };

            ctx.transition(LoopState::Interpreting);
            let content = response.transcript();
            match interpreter::interpret(&response) {
                Err(parse_error) => {
                    warn!(turn, error = %parse_error, "Model response rejected");
                    ctx.conversation
                        .push(Turn::assistant(content, ActionKind::Rejected))?;
                    ctx.conversation.push(Turn::parse_failure(&parse_error))?;
                }

                Ok(Action::Narrate(text)) => {
                    ctx.note_narration(&text);
                    ctx.conversation
                        .push(Turn::assistant(content, ActionKind::Narrate))?;
                    if ctx.reflected {
                        ctx.answer = Some(text);
                        ctx.transition(LoopState::Finished);
                        return Ok(Outcome::Success);
                    }
                    debug!(turn, "No code and no FINISH, asking for clarification");
                    ctx.conversation.push(Turn::user(CLARIFICATION_PROMPT))?;
                }

                Ok(Action::Finish { answer }) => {
                    ctx.note_narration(&answer);
                    ctx.conversation
                        .push(Turn::assistant(content.clone(), ActionKind::Finish))?;
                    if self.config.reflect && !ctx.reflected {
                        info!(turn, "Asking the model to reflect on its answer");
                        ctx.reflected = true;
                        ctx.conversation.push(Turn::user(reflection_prompt(&content)))?;
                        continue;
                    }
                    ctx.answer = Some(answer);
                    ctx.transition(LoopState::Finished);
                    return Ok(Outcome::Success);
                }

                Ok(Action::Execute {
                    narration,
                    code,
                    language,
                    reset,
                }) => {
                    ctx.note_narration(&narration);
                    ctx.conversation
                        .push(Turn::assistant(content, ActionKind::Execute))?;
                    ctx.transition(LoopState::Executing);
                    let result = self.execute(ctx, &code, language, reset).await?;
                    ctx.conversation.push(result)?;
                }
            }
        }
    }

    /// One model round, with retries bounded by the session deadline
    async fn call_model(
        &self,
        ctx: &SessionContext,
        turn: usize,
    ) -> Result<ModelResponse, AgentError> {
        let llm_span = info_span!(
            "llm_call",
            trace_id = %ctx.session_id,
            turn,
            model = %self.provider.model(),
            otel.name = "llm_call"
        );

        let conversation = &ctx.conversation;
        let budget = &ctx.budget;
        let provider = &self.provider;
        let provider_timeout = self.config.provider_timeout;

        let (response, attempts) = self
            .config
            .retry
            .run_until(budget.deadline(), move |attempt| async move {
                let timeout = budget
                    .remaining_time()
                    .map_or(provider_timeout, |left| left.min(provider_timeout));
                let call_start = Instant::now();
                let response = tokio::time::timeout(timeout, provider.send(conversation))
                    .await
                    .map_err(|_| ProviderError::timeout(timeout))??;

                let elapsed = call_start.elapsed();
                LLM_CALL_DURATION
                    .with_label_values(&[provider.name(), provider.model()])
                    .observe(elapsed.as_secs_f64());
                debug!(
                    attempt,
                    duration_ms = elapsed.as_secs_f64() * 1000.0,
                    "LLM call completed"
                );
                Ok::<_, ProviderError>(response)
            })
            .instrument(llm_span)
            .await?;

        info!(
            turn,
            attempts,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "Model responded"
        );
        Ok(response)
    }

    /// Run one block, acquiring the sandbox on first use
    ///
    /// Returns the execution-result turn to append. A missing interpreter is
    /// reported back to the model; other sandbox failures are fatal.
    async fn execute(
        &self,
        ctx: &mut SessionContext,
        code: &str,
        language: Language,
        reset: bool,
    ) -> Result<Turn, AgentError> {
        if !self.config.execute_code {
            info!(%language, "Code execution disabled, not running block");
            return Ok(Turn::execution_notice(language, EXECUTION_DISABLED_NOTICE));
        }

        let session = self.ensure_sandbox(ctx).await?;
        if reset {
            info!(sandbox = %session.name, "Resetting sandbox on request");
            self.sandbox.reset(&session).await?;
        }

        let exec_span = info_span!(
            "code_execution",
            trace_id = %ctx.session_id,
            %language,
            code_len = code.len(),
            otel.name = "code_execution"
        );
        info!(%language, code_len = code.len(), "Executing code");

        let result = self
            .sandbox
            .execute(&session, code, language, &self.config.limits)
            .instrument(exec_span)
            .await;

        match result {
            Ok(result) => {
                CODE_EXECUTIONS
                    .with_label_values(&[language.as_str(), result.status()])
                    .inc();
                CODE_EXECUTION_DURATION
                    .with_label_values(&[language.as_str()])
                    .observe(result.duration.as_secs_f64());
                info!(
                    exit_code = result.exit_code,
                    timed_out = result.timed_out,
                    truncated = result.truncated,
                    duration_ms = result.duration.as_secs_f64() * 1000.0,
                    "Code execution finished"
                );
                ctx.executions
                    .push(ExecutionRecord::new(language, code, &result));
                Ok(Turn::execution_result(language, &result))
            }
            Err(SandboxError::UnsupportedLanguage(unsupported)) => {
                warn!(language = %unsupported, "No interpreter in sandbox");
                CODE_EXECUTIONS
                    .with_label_values(&[language.as_str(), "unsupported"])
                    .inc();
                Ok(Turn::execution_notice(
                    language,
                    format!(
                        "{} is not available in this sandbox. The code was not run; \
                         use another language.",
                        unsupported
                    ),
                ))
            }
            Err(e) => {
                CODE_EXECUTIONS
                    .with_label_values(&[language.as_str(), "failed"])
                    .inc();
                Err(AgentError::SandboxExecution(e))
            }
        }
    }

    async fn ensure_sandbox(&self, ctx: &mut SessionContext) -> Result<SandboxSession, AgentError> {
        if let Some(session) = ctx.lease.as_ref().and_then(SandboxLease::session) {
            return Ok(session.clone());
        }

        let sandbox = Arc::clone(&self.sandbox);
        let session_id = ctx.session_id.clone();
        let pending = ctx.pending_acquire.insert(tokio::spawn(async move {
            let session = sandbox.acquire(&session_id).await?;
            Ok(SandboxLease::new(sandbox, session))
        }));
        let joined = pending.await;
        ctx.pending_acquire = None;

        let lease = joined
            .map_err(|e| SandboxError::provision_with("sandbox acquisition task failed", e))
            .and_then(|result| result)
            .map_err(AgentError::SandboxProvision)?;
        let session = lease
            .session()
            .cloned()
            .ok_or_else(|| AgentError::Internal("acquired lease holds no session".to_string()))?;
        info!(sandbox = %session.name, backend = self.sandbox.name(), "Sandbox acquired");
        ctx.lease = Some(lease);
        Ok(session)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("agent loop panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("agent loop panicked: {}", message)
    } else {
        "agent loop panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::BudgetExhausted(Exhaustion::Turns).exit_code(), 2);
        assert_eq!(Outcome::Fatal(AgentError::Cancelled).exit_code(), 1);
        assert_eq!(Outcome::Fatal(AgentError::Cancelled).label(), "fatal");
    }

    #[test]
    fn test_error_boundaries() {
        let provider = AgentError::Provider {
            attempts: 3,
            source: ProviderError::from_status(503, "down"),
        };
        assert_eq!(provider.boundary(), "provider");
        assert_eq!(
            AgentError::from(SandboxError::provision("no daemon")).boundary(),
            "sandbox"
        );
        assert!(matches!(
            AgentError::from(SandboxError::provision("no daemon")),
            AgentError::SandboxProvision(_)
        ));
        assert!(matches!(
            AgentError::from(SandboxError::execution("exec died")),
            AgentError::SandboxExecution(_)
        ));
        assert_eq!(AgentError::Internal("x".into()).boundary(), "agent");
    }

    #[test]
    fn test_reflection_prompt_wording() {
        assert_eq!(
            reflection_prompt("42"),
            "Please reflect on your last output, which was '42'. \
             If you can improve it, please do so and provide a new response."
        );
    }

    #[test]
    fn test_best_answer_fallbacks() {
        let mut ctx = SessionContext::new(SessionId::from("s"), Budget::default());
        assert_eq!(ctx.best_answer(), NO_ANSWER_NOTICE);

        ctx.conversation.push(Turn::user("task")).unwrap();
        ctx.conversation
            .push(Turn::assistant("thinking out loud", ActionKind::Narrate))
            .unwrap();
        assert_eq!(ctx.best_answer(), "thinking out loud");

        ctx.note_narration("partial result: 7");
        assert_eq!(ctx.best_answer(), "partial result: 7");

        ctx.answer = Some("7".to_string());
        assert_eq!(ctx.best_answer(), "7");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload), "agent loop panicked: boom");
    }
}
