//! sandagent - single-agent LLM orchestrator with sandboxed code execution
//!
//! The agent talks to a chat model, runs the code it proposes in an isolated
//! per-session sandbox, and feeds the results back until the model finishes
//! or the budget runs out.
//!
//! # Modules
//!
//! - `provider` - chat provider adapters (Ollama, OpenAI-compatible, Anthropic)
//! - `interpreter` - classifies a model response as narration, code or answer
//! - `sandbox` - sandbox lifecycle (Docker containers or local processes)
//! - `agent` - the execution loop, budgets, retries and saved sessions
//! - `conversation` - the append-only transcript of a session
//! - `config` - settings that assemble the pieces
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use sandagent::config::Settings;
//!
//! let settings = Settings::default();
//! let sandbox = settings.select_sandbox().await?;
//! let controller = settings.build_controller(sandbox)?;
//!
//! let run = controller.run("What is the 20th Fibonacci number?").await;
//! println!("{}", run.answer);
//! ```

pub mod agent;
pub mod config;
pub mod conversation;
pub mod interpreter;
pub mod metrics;
pub mod provider;
pub mod sandbox;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, AgentError, AgentRun, Budget, Outcome};
pub use conversation::{Conversation, SessionId, Turn};
pub use interpreter::{Action, Language};
pub use provider::{ChatProvider, ModelResponse, ProviderConfig, ProviderError};
pub use sandbox::{ExecutionResult, ResourceLimits, SandboxError, SandboxManager, SandboxSession};
