//! Integration tests for the agent loop
//!
//! A scripted provider replays canned responses and a counting sandbox
//! records every lifecycle call, so each terminal path can be checked for
//! exactly-once release and for transcript ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sandagent::agent::{
    AgentConfig, AgentController, AgentError, Budget, Exhaustion, Outcome, RetryPolicy,
    DEFAULT_SYSTEM_PROMPT,
};
use sandagent::conversation::{ActionKind, Conversation, Role};
use sandagent::interpreter::Language;
use sandagent::provider::{
    ChatProvider, ModelResponse, ProviderError, ProviderErrorKind, ResponsePart, ToolCall,
};
use sandagent::sandbox::{
    ExecutionResult, ProcessSandbox, ProcessSandboxConfig, ResourceLimits, SandboxError,
    SandboxManager, SandboxSession, TIMEOUT_EXIT_CODE,
};
use sandagent::SessionId;

// ─────────────────────────────────────────────────────────────────────────────
// Mocks
// ─────────────────────────────────────────────────────────────────────────────

enum Scripted {
    Reply(ModelResponse),
    Fail(ProviderError),
    Hang,
    Panic,
}

/// Provider replaying a fixed script; repeats the last entry when it runs out
struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    fallback: String,
    calls: AtomicUsize,
    seen: Mutex<Vec<Conversation>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: "Still thinking about it.".to_string(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn replies(texts: &[&str]) -> Arc<Self> {
        Self::new(
            texts
                .iter()
                .map(|t| Scripted::Reply(ModelResponse::from_text(*t)))
                .collect(),
        )
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "test-model"
    }

    async fn send(&self, conversation: &Conversation) -> Result<ModelResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(conversation.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ModelResponse::from_text(""))
            }
            Some(Scripted::Panic) => panic!("provider exploded"),
            None => Ok(ModelResponse::from_text(self.fallback.clone())),
        }
    }
}

#[derive(Default)]
struct Counters {
    acquires: AtomicUsize,
    executes: AtomicUsize,
    resets: AtomicUsize,
    releases: AtomicUsize,
}

enum SandboxBehavior {
    Ok,
    FailAcquire,
    FailExecute,
    Timeout,
    NoJavaScript,
}

/// Sandbox that fakes execution and counts lifecycle calls
struct CountingSandbox {
    counters: Counters,
    behavior: SandboxBehavior,
    executed: Mutex<Vec<(Language, String)>>,
}

impl CountingSandbox {
    fn new(behavior: SandboxBehavior) -> Arc<Self> {
        Arc::new(Self {
            counters: Counters::default(),
            behavior,
            executed: Mutex::new(Vec::new()),
        })
    }

    fn acquires(&self) -> usize {
        self.counters.acquires.load(Ordering::SeqCst)
    }

    fn executes(&self) -> usize {
        self.counters.executes.load(Ordering::SeqCst)
    }

    fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxManager for CountingSandbox {
    fn name(&self) -> &str {
        "counting"
    }

    async fn preflight(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn acquire(&self, session_id: &SessionId) -> Result<SandboxSession, SandboxError> {
        self.counters.acquires.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            SandboxBehavior::FailAcquire => Err(SandboxError::provision("runtime unreachable")),
            _ => Ok(SandboxSession::new(session_id, ResourceLimits::default())),
        }
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        self.counters.executes.fetch_add(1, Ordering::SeqCst);
        session.next_invocation();
        self.executed
            .lock()
            .unwrap()
            .push((language, code.to_string()));
        match self.behavior {
            SandboxBehavior::FailExecute => Err(SandboxError::execution("container vanished")),
            SandboxBehavior::Timeout => Ok(ExecutionResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: TIMEOUT_EXIT_CODE,
                duration: limits.timeout,
                truncated: false,
                timed_out: true,
            }),
            SandboxBehavior::NoJavaScript if language == Language::JavaScript => {
                Err(SandboxError::UnsupportedLanguage(language))
            }
            _ => Ok(ExecutionResult {
                stdout: "42\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration: Duration::from_millis(5),
                truncated: false,
                timed_out: false,
            }),
        }
    }

    async fn reset(&self, _session: &SandboxSession) -> Result<(), SandboxError> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, _session: SandboxSession) -> Result<(), SandboxError> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Real process sandbox whose acquire stalls after provisioning
struct SlowAcquireSandbox {
    inner: ProcessSandbox,
    stall: Duration,
}

#[async_trait]
impl SandboxManager for SlowAcquireSandbox {
    fn name(&self) -> &str {
        "slow-acquire"
    }

    async fn preflight(&self) -> Result<(), SandboxError> {
        self.inner.preflight().await
    }

    async fn acquire(&self, session_id: &SessionId) -> Result<SandboxSession, SandboxError> {
        let session = self.inner.acquire(session_id).await?;
        tokio::time::sleep(self.stall).await;
        Ok(session)
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        self.inner.execute(session, code, language, limits).await
    }

    async fn reset(&self, session: &SandboxSession) -> Result<(), SandboxError> {
        self.inner.reset(session).await
    }

    async fn release(&self, session: SandboxSession) -> Result<(), SandboxError> {
        self.inner.release(session).await
    }
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..AgentConfig::default()
    }
}

fn controller(
    provider: &Arc<ScriptedProvider>,
    sandbox: &Arc<CountingSandbox>,
    config: AgentConfig,
) -> AgentController {
    AgentController::new(provider.clone(), sandbox.clone(), config)
}

/// Every execution result sits right after an assistant turn asking for it
fn assert_ordering(conversation: &Conversation) {
    assert!(conversation.validate().is_ok());
    for (i, turn) in conversation.iter().enumerate() {
        if turn.role == Role::ExecutionResult {
            let previous = &conversation.turns()[i - 1];
            assert_eq!(previous.role, Role::Assistant);
            assert!(previous.action().unwrap().requests_execution());
        }
    }
}

const RUN_CODE: &str = "Let me compute it.\n```python\nprint(6 * 7)\n```";
const FINISH: &str = "The answer is 42.\nFINISH";

// ─────────────────────────────────────────────────────────────────────────────
// Terminal paths and release
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_success_executes_then_finishes() {
    let provider = ScriptedProvider::replies(&[RUN_CODE, FINISH]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config())
        .run("What is 6 * 7?")
        .await;

    assert!(run.outcome.is_success());
    assert_eq!(run.exit_code(), 0);
    assert_eq!(run.answer, "The answer is 42.");
    assert_eq!(run.turns_used, 2);
    assert_eq!(run.executions.len(), 1);
    assert_eq!(run.executions[0].stdout, "42\n");
    assert_eq!(sandbox.acquires(), 1);
    assert_eq!(sandbox.releases(), 1);
    assert!(run.conversation.is_frozen());
    assert_ordering(&run.conversation);

    let roles: Vec<Role> = run.conversation.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::ExecutionResult,
            Role::Assistant
        ]
    );
    assert_eq!(run.conversation.turns()[0].content, DEFAULT_SYSTEM_PROMPT);
}

#[tokio::test]
async fn test_finish_without_code_never_acquires() {
    let provider = ScriptedProvider::replies(&["Paris.\nFINISH"]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config())
        .run("Capital of France?")
        .await;

    assert!(run.outcome.is_success());
    assert_eq!(run.answer, "Paris.");
    assert_eq!(sandbox.acquires(), 0);
    assert_eq!(sandbox.releases(), 0);
}

#[tokio::test]
async fn test_sandbox_reused_across_executions() {
    let provider = ScriptedProvider::replies(&[RUN_CODE, RUN_CODE, RUN_CODE, FINISH]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(sandbox.acquires(), 1);
    assert_eq!(sandbox.executes(), 3);
    assert_eq!(sandbox.releases(), 1);
}

#[tokio::test]
async fn test_budget_exhausted_with_narrating_model() {
    let provider = ScriptedProvider::replies(&["Hmm, let me think.", "Still thinking."]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let config = AgentConfig {
        budget: Budget::turns(2),
        ..fast_config()
    };
    let run = controller(&provider, &sandbox, config).run("task").await;

    assert!(matches!(
        run.outcome,
        Outcome::BudgetExhausted(Exhaustion::Turns)
    ));
    assert_eq!(run.exit_code(), 2);
    assert_eq!(run.turns_used, 2);
    assert_eq!(provider.calls(), 2);
    assert_eq!(run.answer, "Still thinking.");
    assert_eq!(sandbox.releases(), 0);

    // Clarification prompt after each narration
    let users = run
        .conversation
        .iter()
        .filter(|t| t.role == Role::User)
        .count();
    assert_eq!(users, 3);
}

#[tokio::test]
async fn test_budget_exhausted_after_execution_releases_once() {
    let provider = ScriptedProvider::replies(&[RUN_CODE, RUN_CODE]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let config = AgentConfig {
        budget: Budget::turns(2),
        ..fast_config()
    };
    let run = controller(&provider, &sandbox, config).run("task").await;

    assert!(matches!(run.outcome, Outcome::BudgetExhausted(_)));
    assert_eq!(run.answer, "Let me compute it.");
    assert_eq!(sandbox.acquires(), 1);
    assert_eq!(sandbox.releases(), 1);
    assert_ordering(&run.conversation);
}

#[tokio::test]
async fn test_wall_clock_budget() {
    let provider = ScriptedProvider::new(vec![Scripted::Hang]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let config = AgentConfig {
        budget: Budget::turns(5).with_max_duration(Duration::from_millis(100)),
        ..fast_config()
    };
    let run = controller(&provider, &sandbox, config).run("task").await;

    assert!(matches!(
        run.outcome,
        Outcome::BudgetExhausted(Exhaustion::WallClock)
    ));
    assert!(!run.answer.is_empty());
}

#[tokio::test]
async fn test_provider_auth_error_is_fatal_and_not_retried() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Reply(ModelResponse::from_text(RUN_CODE)),
        Scripted::Fail(ProviderError::from_status(401, "invalid api key")),
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    match &run.outcome {
        Outcome::Fatal(AgentError::Provider { attempts, source }) => {
            assert_eq!(*attempts, 1);
            assert_eq!(source.kind, ProviderErrorKind::Auth);
        }
        other => panic!("expected provider failure, got {:?}", other),
    }
    assert_eq!(run.exit_code(), 1);
    assert_eq!(provider.calls(), 2);
    assert_eq!(sandbox.releases(), 1);
}

#[tokio::test]
async fn test_transient_provider_errors_retried() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Fail(ProviderError::from_status(503, "overloaded")),
        Scripted::Fail(ProviderError::new(ProviderErrorKind::Network, "reset")),
        Scripted::Reply(ModelResponse::from_text(FINISH)),
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(provider.calls(), 3);
    assert_eq!(run.turns_used, 1);
}

#[tokio::test]
async fn test_retries_exhausted_is_fatal() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Fail(ProviderError::from_status(500, "a")),
        Scripted::Fail(ProviderError::from_status(502, "b")),
        Scripted::Fail(ProviderError::from_status(503, "c")),
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    match &run.outcome {
        Outcome::Fatal(e @ AgentError::Provider { attempts: 3, .. }) => {
            assert_eq!(e.boundary(), "provider")
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(run.answer, sandagent::agent::controller::NO_ANSWER_NOTICE);
}

#[tokio::test]
async fn test_provision_failure_is_fatal() {
    let provider = ScriptedProvider::replies(&[RUN_CODE]);
    let sandbox = CountingSandbox::new(SandboxBehavior::FailAcquire);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(matches!(
        run.outcome,
        Outcome::Fatal(AgentError::SandboxProvision(_))
    ));
    assert_eq!(sandbox.acquires(), 1);
    assert_eq!(sandbox.releases(), 0);
    assert_eq!(run.answer, "Let me compute it.");
}

#[tokio::test]
async fn test_execution_infrastructure_failure_releases_once() {
    let provider = ScriptedProvider::replies(&[RUN_CODE]);
    let sandbox = CountingSandbox::new(SandboxBehavior::FailExecute);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    match &run.outcome {
        Outcome::Fatal(e @ AgentError::SandboxExecution(_)) => assert_eq!(e.boundary(), "sandbox"),
        other => panic!("expected sandbox failure, got {:?}", other),
    }
    assert_eq!(sandbox.releases(), 1);
}

#[tokio::test]
async fn test_cancellation_releases_sandbox() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Reply(ModelResponse::from_text(RUN_CODE)),
        Scripted::Hang,
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let agent = controller(&provider, &sandbox, fast_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let run = agent.run_with_cancel("task", cancel).await;
    assert!(matches!(run.outcome, Outcome::Fatal(AgentError::Cancelled)));
    assert_eq!(sandbox.executes(), 1);
    assert_eq!(sandbox.releases(), 1);
    assert!(run.conversation.is_frozen());
}

#[tokio::test]
async fn test_cancellation_during_acquire_removes_environment() {
    let root = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(SlowAcquireSandbox {
        inner: ProcessSandbox::new(ProcessSandboxConfig {
            root: root.path().to_path_buf(),
            confine: false,
            ..ProcessSandboxConfig::default()
        }),
        stall: Duration::from_millis(300),
    });
    let provider = ScriptedProvider::replies(&[RUN_CODE]);
    let agent = AgentController::new(provider.clone(), sandbox.clone(), fast_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let run = agent.run_with_cancel("task", cancel).await;
    assert!(matches!(run.outcome, Outcome::Fatal(AgentError::Cancelled)));
    assert!(run.executions.is_empty());

    assert!(sandbox.inner.workdir(&run.session_id).await.is_none());
    let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "environment left behind: {:?}", leftovers);
}

#[tokio::test]
async fn test_panic_in_loop_becomes_internal_error() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Reply(ModelResponse::from_text(RUN_CODE)),
        Scripted::Panic,
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    match &run.outcome {
        Outcome::Fatal(AgentError::Internal(message)) => {
            assert!(message.contains("provider exploded"))
        }
        other => panic!("expected internal error, got {:?}", other),
    }
    assert_eq!(sandbox.releases(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpretation inside the loop
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_code_and_finish_executes_first() {
    let provider = ScriptedProvider::replies(&["Done. ```python\nprint(1)\n```\nFINISH", FINISH]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(sandbox.executes(), 1);
    assert_eq!(
        sandbox.executed.lock().unwrap()[0],
        (Language::Python, "print(1)".to_string())
    );
    assert_eq!(run.turns_used, 2);
}

#[tokio::test]
async fn test_parse_error_fed_back_to_model() {
    let provider = ScriptedProvider::replies(&[
        "```python\nprint(1)\n```\nand\n```bash\necho 2\n```",
        FINISH,
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(sandbox.executes(), 0);
    let turns = run.conversation.turns();
    assert_eq!(turns[2].action(), Some(ActionKind::Rejected));
    assert_eq!(turns[3].role, Role::ExecutionResult);
    assert!(turns[3].metadata.parse_error);
    assert!(turns[3].content.contains("2 executable code blocks"));
    assert_ordering(&run.conversation);
}

#[tokio::test]
async fn test_timeout_is_a_result_not_an_error() {
    let provider = ScriptedProvider::replies(&["```bash\nsleep 100\n```", "It timed out.\nFINISH"]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Timeout);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert!(run.executions[0].timed_out);
    assert_eq!(run.executions[0].exit_code, TIMEOUT_EXIT_CODE);
    let result_turn = &run.conversation.turns()[3];
    assert!(result_turn.metadata.timed_out);
    assert!(result_turn.content.contains("timed out"));
}

#[tokio::test]
async fn test_unsupported_language_reported_to_model() {
    let provider = ScriptedProvider::replies(&[
        "```javascript\nconsole.log(1)\n```",
        RUN_CODE,
        FINISH,
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::NoJavaScript);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(run.executions.len(), 1);
    assert!(run.conversation.turns()[3]
        .content
        .contains("javascript is not available"));
    assert_eq!(sandbox.releases(), 1);
}

#[tokio::test]
async fn test_native_tool_call_executes() {
    let call = ModelResponse::new(vec![ResponsePart::ToolCall(ToolCall {
        id: Some("call_1".to_string()),
        name: "execute_code".to_string(),
        arguments: serde_json::json!({"language": "bash", "code": "echo hi"}),
    })]);
    let provider = ScriptedProvider::new(vec![
        Scripted::Reply(call),
        Scripted::Reply(ModelResponse::from_text(FINISH)),
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(
        sandbox.executed.lock().unwrap()[0],
        (Language::Bash, "echo hi".to_string())
    );
}

#[tokio::test]
async fn test_reset_directive_resets_sandbox() {
    let provider = ScriptedProvider::replies(&[
        RUN_CODE,
        "```python\n# sandagent: reset\nprint('fresh')\n```",
        FINISH,
    ]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let run = controller(&provider, &sandbox, fast_config()).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(sandbox.resets(), 1);
    assert_eq!(
        sandbox.executed.lock().unwrap()[1],
        (Language::Python, "print('fresh')".to_string())
    );
    assert_eq!(sandbox.releases(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Reflection and execution toggle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reflection_asks_once() {
    let provider = ScriptedProvider::replies(&["41\nFINISH", "Actually 42.\nFINISH"]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let config = AgentConfig {
        reflect: true,
        ..fast_config()
    };
    let run = controller(&provider, &sandbox, config).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(run.answer, "Actually 42.");
    assert_eq!(provider.calls(), 2);
    let reflection = &run.conversation.turns()[3];
    assert_eq!(reflection.role, Role::User);
    assert!(reflection
        .content
        .starts_with("Please reflect on your last output, which was '41\nFINISH'."));
}

#[tokio::test]
async fn test_execution_disabled_skips_sandbox() {
    let provider = ScriptedProvider::replies(&[RUN_CODE, FINISH]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let config = AgentConfig {
        execute_code: false,
        ..fast_config()
    };
    let run = controller(&provider, &sandbox, config).run("task").await;

    assert!(run.outcome.is_success());
    assert_eq!(sandbox.acquires(), 0);
    assert_eq!(sandbox.executes(), 0);
    assert!(run.executions.is_empty());
    assert!(run.conversation.turns()[3]
        .content
        .contains("Code execution is disabled"));
    assert_ordering(&run.conversation);
}

#[tokio::test]
async fn test_concurrent_sessions_get_distinct_ids() {
    let provider = ScriptedProvider::replies(&[RUN_CODE, RUN_CODE, FINISH, FINISH]);
    let sandbox = CountingSandbox::new(SandboxBehavior::Ok);
    let agent = controller(&provider, &sandbox, fast_config());

    let (a, b) = tokio::join!(agent.run("first"), agent.run("second"));
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(sandbox.acquires(), sandbox.releases());
}
