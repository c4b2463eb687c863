//! Saved session transcripts
//!
//! A finished [`AgentRun`] can be written to disk as JSON for audit and
//! listed or reloaded later.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::controller::{AgentRun, ExecutionRecord};
use crate::conversation::Conversation;

/// A saved agent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// The task that started this session
    pub task: String,
    pub model: String,
    /// "success", "budget_exhausted" or "fatal"
    pub outcome: String,
    /// Error message of a fatal run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub answer: String,
    pub turns_used: usize,
    pub duration_ms: f64,
    pub executions: Vec<ExecutionRecord>,
    pub conversation: Conversation,
}

impl SessionRecord {
    pub fn from_run(run: &AgentRun, task: impl Into<String>, model: impl Into<String>) -> Self {
        let error = match &run.outcome {
            super::Outcome::Fatal(e) => Some(e.to_string()),
            _ => None,
        };
        Self {
            id: run.session_id.to_string(),
            created_at: Utc::now(),
            task: task.into(),
            model: model.into(),
            outcome: run.outcome.label().to_string(),
            error,
            answer: run.answer.clone(),
            turns_used: run.turns_used,
            duration_ms: run.duration.as_secs_f64() * 1000.0,
            executions: run.executions.clone(),
            conversation: run.conversation.clone(),
        }
    }
}

/// Session storage manager
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Store under `~/.sandagent/sessions`
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".sandagent").join("sessions"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save a session, returning the file written
    pub fn save(&self, record: &SessionRecord) -> std::io::Result<PathBuf> {
        let path = self.session_path(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Load a session and re-check its transcript ordering
    pub fn load(&self, session_id: &str) -> std::io::Result<SessionRecord> {
        load_from_path(&self.session_path(session_id))
    }

    /// List all sessions, newest first
    pub fn list(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(record) = load_from_path(&path) {
                    sessions.push(SessionSummary {
                        task: truncate(&record.task, 50),
                        id: record.id,
                        created_at: record.created_at,
                        outcome: record.outcome,
                        turns_used: record.turns_used,
                    });
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    pub fn delete(&self, session_id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.session_path(session_id))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", session_id))
    }
}

fn load_from_path(path: &Path) -> std::io::Result<SessionRecord> {
    let json = std::fs::read_to_string(path)?;
    let record: SessionRecord = serde_json::from_str(&json)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    record
        .conversation
        .validate()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(record)
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub outcome: String,
    pub turns_used: usize,
}

/// Truncate to `max_chars` characters, adding an ellipsis
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
