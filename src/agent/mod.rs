//! Agent module for LLM-driven code execution
//!
//! This module provides the agent loop that orchestrates:
//! - a chat provider (Ollama, OpenAI-compatible or Anthropic)
//! - the action interpreter
//! - a per-session sandbox for running model-written code
//!
//! # Architecture
//!
//! ```text
//! User Task → AgentController → ChatProvider::send(conversation)
//!                  ↓
//!           interpreter::interpret(response)
//!                  ↓
//!        Execute ──► SandboxManager::acquire() (first time only)
//!                  ↓
//!           SandboxManager::execute() → stdout/stderr/exit_code
//!                  ↓
//!           Feed result back to the model → Loop or Finish
//!                  ↓
//!           SandboxLease::finish() → release (exactly once)
//! ```

pub mod budget;
pub mod controller;
pub mod retry;
pub mod sessions;

pub use budget::{Budget, BudgetTracker, Exhaustion};
pub use controller::{
    AgentConfig, AgentController, AgentError, AgentRun, ExecutionRecord, LoopState, Outcome,
    DEFAULT_SYSTEM_PROMPT,
};
pub use retry::{RetryExhausted, RetryPolicy};
pub use sessions::{SessionRecord, SessionStore, SessionSummary};
