//! Conversation state for one agent session
//!
//! A [`Conversation`] is the ordered, append-only transcript of a session:
//! system and user messages, assistant responses, and execution results fed
//! back from the sandbox.
//!
//! # Ordering
//!
//! ```text
//! System → User → Assistant(Execute) → ExecutionResult → Assistant(Narrate) → User → ...
//!                         │                  ▲
//!                         └──── must be ─────┘
//!                            adjacent
//! ```
//!
//! An execution-result turn is only accepted directly after an assistant turn
//! that asked for execution, and the only turn allowed after it is the next
//! assistant turn. [`Conversation::push`] enforces this; a session that ended
//! is frozen and rejects further turns.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::interpreter::{Language, ParseError};
use crate::sandbox::ExecutionResult;

/// Unique identifier of one agent session (UUIDv7, time-sortable)
///
/// Doubles as the trace id in logs and as the suffix of the sandbox
/// environment name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ExecutionResult,
}

/// Classified intent of an assistant turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Narrate,
    Execute,
    Finish,
    /// The response tried to run code but could not be parsed
    Rejected,
}

impl ActionKind {
    /// Whether the next turn must be an execution result
    pub fn requests_execution(self) -> bool {
        matches!(self, ActionKind::Execute | ActionKind::Rejected)
    }
}

/// Structured metadata attached to a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub truncated: bool,
    /// Execution-result turn reporting a parse failure instead of a run
    #[serde(default)]
    pub parse_error: bool,
}

/// One message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: TurnMetadata,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            metadata: TurnMetadata::default(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: TurnMetadata::default(),
        }
    }

    pub fn assistant(content: impl Into<String>, action: ActionKind) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: TurnMetadata {
                action: Some(action),
                ..TurnMetadata::default()
            },
        }
    }

    /// Result of running code in the sandbox
    pub fn execution_result(language: Language, result: &ExecutionResult) -> Self {
        Self {
            role: Role::ExecutionResult,
            content: format!("Execution result ({}):\n{}", language, result.render()),
            metadata: TurnMetadata {
                language: Some(language),
                exit_code: Some(result.exit_code),
                duration_ms: Some(result.duration.as_secs_f64() * 1000.0),
                timed_out: result.timed_out,
                truncated: result.truncated,
                ..TurnMetadata::default()
            },
        }
    }

    /// Execution result standing in for a run that never happened
    /// (execution disabled, language unavailable)
    pub fn execution_notice(language: Language, notice: impl AsRef<str>) -> Self {
        Self {
            role: Role::ExecutionResult,
            content: format!("Execution result ({}):\n{}", language, notice.as_ref()),
            metadata: TurnMetadata {
                language: Some(language),
                ..TurnMetadata::default()
            },
        }
    }

    /// Synthetic execution result reporting why the response was not runnable
    pub fn parse_failure(error: &ParseError) -> Self {
        Self {
            role: Role::ExecutionResult,
            content: format!(
                "Your last response could not be executed: {}.\n\
                 Reply with exactly one fenced code block tagged with its language \
                 (for example ```python), or finish with a line containing only FINISH.",
                error
            ),
            metadata: TurnMetadata {
                parse_error: true,
                ..TurnMetadata::default()
            },
        }
    }

    pub fn action(&self) -> Option<ActionKind> {
        self.metadata.action
    }
}

/// Error type for conversation mutations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation is frozen; the session has ended")]
    Frozen,
    #[error("execution result at position {position} does not follow an assistant turn requesting execution")]
    OrphanExecutionResult { position: usize },
    #[error("turn at position {position} must be an execution result for the preceding assistant turn")]
    MissingExecutionResult { position: usize },
    #[error("turn at position {position} follows an execution result but is not an assistant turn")]
    ResultNotAnswered { position: usize },
}

/// Ordered, append-only transcript of one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
    #[serde(default)]
    frozen: bool,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, enforcing the causal ordering of execution results
    pub fn push(&mut self, turn: Turn) -> Result<(), ConversationError> {
        if self.frozen {
            return Err(ConversationError::Frozen);
        }
        check_adjacent(self.turns.last(), &turn, self.turns.len())?;
        self.turns.push(turn);
        Ok(())
    }

    /// Freeze the transcript; later pushes fail with [`ConversationError::Frozen`]
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Turn> + ExactSizeIterator {
        self.turns.iter()
    }

    /// Total characters of content, used for context window checks
    pub fn content_chars(&self) -> usize {
        self.turns.iter().map(|t| t.content.chars().count()).sum()
    }

    /// Re-check the ordering invariant over the whole transcript
    ///
    /// `push` already enforces it; this is for transcripts loaded from disk.
    pub fn validate(&self) -> Result<(), ConversationError> {
        let mut previous = None;
        for (position, turn) in self.turns.iter().enumerate() {
            check_adjacent(previous, turn, position)?;
            previous = Some(turn);
        }
        Ok(())
    }
}

fn check_adjacent(
    previous: Option<&Turn>,
    next: &Turn,
    position: usize,
) -> Result<(), ConversationError> {
    let previous_requested = previous
        .filter(|t| t.role == Role::Assistant)
        .and_then(Turn::action)
        .map(ActionKind::requests_execution)
        .unwrap_or(false);

    match next.role {
        Role::ExecutionResult if !previous_requested => {
            Err(ConversationError::OrphanExecutionResult { position })
        }
        Role::ExecutionResult => Ok(()),
        _ if previous_requested => Err(ConversationError::MissingExecutionResult { position }),
        Role::Assistant => Ok(()),
        _ if previous.map(|t| t.role) == Some(Role::ExecutionResult) => {
            Err(ConversationError::ResultNotAnswered { position })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_result() -> ExecutionResult {
        ExecutionResult {
            stdout: "42\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(12),
            truncated: false,
            timed_out: false,
        }
    }

    #[test]
    fn test_execution_result_after_execute() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::user("compute")).unwrap();
        conversation
            .push(Turn::assistant("```python\nprint(42)\n```", ActionKind::Execute))
            .unwrap();
        conversation
            .push(Turn::execution_result(Language::Python, &sample_result()))
            .unwrap();
        conversation
            .push(Turn::assistant("The answer is 42\nFINISH", ActionKind::Finish))
            .unwrap();
        assert_eq!(conversation.len(), 4);
        assert!(conversation.validate().is_ok());
    }

    #[test]
    fn test_orphan_execution_result_rejected() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::user("hi")).unwrap();
        conversation
            .push(Turn::assistant("hello", ActionKind::Narrate))
            .unwrap();
        let err = conversation
            .push(Turn::execution_result(Language::Python, &sample_result()))
            .unwrap_err();
        assert_eq!(err, ConversationError::OrphanExecutionResult { position: 2 });
    }

    #[test]
    fn test_execute_requires_result_next() {
        let mut conversation = Conversation::new();
        conversation
            .push(Turn::assistant("```sh\nls\n```", ActionKind::Execute))
            .unwrap();
        let err = conversation.push(Turn::user("well?")).unwrap_err();
        assert_eq!(err, ConversationError::MissingExecutionResult { position: 1 });
    }

    #[test]
    fn test_result_must_be_answered_by_assistant() {
        let mut conversation = Conversation::new();
        conversation
            .push(Turn::assistant("```sh\nls\n```", ActionKind::Execute))
            .unwrap();
        conversation
            .push(Turn::execution_result(Language::Bash, &sample_result()))
            .unwrap();
        let err = conversation.push(Turn::user("next")).unwrap_err();
        assert_eq!(err, ConversationError::ResultNotAnswered { position: 2 });
    }

    #[test]
    fn test_rejected_turn_takes_parse_failure() {
        let mut conversation = Conversation::new();
        conversation
            .push(Turn::assistant("```python\nprint(", ActionKind::Rejected))
            .unwrap();
        let turn = Turn::parse_failure(&ParseError::UnclosedFence { line: 1 });
        assert!(turn.metadata.parse_error);
        conversation.push(turn).unwrap();
    }

    #[test]
    fn test_frozen_conversation_rejects_push() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::user("task")).unwrap();
        conversation.freeze();
        assert!(conversation.is_frozen());
        assert_eq!(
            conversation.push(Turn::user("more")).unwrap_err(),
            ConversationError::Frozen
        );
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn test_execution_result_metadata() {
        let turn = Turn::execution_result(Language::Python, &sample_result());
        assert_eq!(turn.role, Role::ExecutionResult);
        assert_eq!(turn.metadata.exit_code, Some(0));
        assert_eq!(turn.metadata.language, Some(Language::Python));
        assert!(turn.content.starts_with("Execution result (python):"));
        assert!(turn.content.contains("42"));
    }

    #[test]
    fn test_iter_walks_back_from_latest() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::system("be brief")).unwrap();
        conversation.push(Turn::user("hi")).unwrap();
        conversation
            .push(Turn::assistant("hello", ActionKind::Narrate))
            .unwrap();

        let latest = conversation.iter().rev().next().unwrap();
        assert_eq!(latest.content, "hello");
        assert_eq!(conversation.iter().len(), 3);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_conversation_serialization() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::system("be brief")).unwrap();
        conversation.push(Turn::user("hi")).unwrap();
        let json = serde_json::to_string(&conversation).unwrap();
        assert!(json.contains("\"role\":\"system\""));
        let restored: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, conversation);
    }
}
