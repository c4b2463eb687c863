//! Action interpreter - classifies a model response
//!
//! A response is split into typed segments:
//!
//! ```text
//! "Let me check.\n```python\nprint(1)\n```\nFINISH"
//!        │                 │                 │
//!        ▼                 ▼                 ▼
//!   Narrate("Let me   Execute(python,    Finish("")
//!    check.")          "print(1)")
//! ```
//!
//! and folded into a single [`Action`]:
//!
//! - one executable block → `Execute` (even when a FINISH marker is present;
//!   the agent cannot finish in the same turn it still asks to run code)
//! - no executable block, a FINISH marker → `Finish`
//! - neither → `Narrate`
//!
//! Executable blocks are triple-backtick fences whose info string names a
//! supported language. Fences without a tag, or tagged with anything else
//! (`json`, `text`, ...), are treated as narrative, and so is a stray
//! unclosed fence that names no language.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{ModelResponse, EXECUTE_CODE_TOOL};

/// Fence delimiter for code blocks
pub const FENCE: &str = "```";

/// Completion marker, on a line of its own or as `FINISH: <answer>`
pub const FINISH_MARKER: &str = "FINISH";

/// First-line directive asking for a fresh sandbox before running the block
pub const RESET_DIRECTIVE: &str = "sandagent: reset";

/// Languages the sandboxes know how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Bash,
    JavaScript,
}

impl Language {
    /// Resolve a fence info string or tool argument to a language
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "bash" | "sh" | "shell" => Some(Language::Bash),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Bash => "bash",
            Language::JavaScript => "javascript",
        }
    }

    fn comment_prefix(&self) -> &'static str {
        match self {
            Language::JavaScript => "//",
            Language::Python | Language::Bash => "#",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed piece of a model response
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Narrate(String),
    Execute { code: String, language: Language },
    Finish(String),
}

/// The single next step implied by an assistant turn
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Narrate(String),
    Execute {
        narration: String,
        code: String,
        language: Language,
        /// Block started with the reset directive
        reset: bool,
    },
    Finish {
        answer: String,
    },
}

impl Action {
    /// Narrative text carried by this action
    pub fn narration(&self) -> &str {
        match self {
            Action::Narrate(text) => text,
            Action::Execute { narration, .. } => narration,
            Action::Finish { answer } => answer,
        }
    }
}

/// Error type for unparseable responses
///
/// Always recoverable: the loop reports it back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("code fence opened on line {line} is never closed")]
    UnclosedFence { line: usize },
    #[error("found {count} executable code blocks; exactly one is allowed per turn")]
    MultipleCodeBlocks { count: usize },
    #[error("the {language} code block is empty")]
    EmptyCode { language: Language },
    #[error("invalid execute_code tool call: {0}")]
    InvalidToolCall(String),
    #[error("unknown tool `{0}`; the only tool is execute_code")]
    UnknownTool(String),
}

/// Classify a raw response text
pub fn parse(text: &str) -> Result<Action, ParseError> {
    fold(parse_segments(text)?)
}

/// Classify a provider response, including native `execute_code` tool calls
///
/// A tool call is taken as-is, never re-parsed, so its code may contain
/// fences. A tool call next to a fenced block is ambiguous like any other
/// response with two blocks.
pub fn interpret(response: &ModelResponse) -> Result<Action, ParseError> {
    let mut calls = Vec::new();
    for call in response.tool_calls() {
        if call.name != EXECUTE_CODE_TOOL {
            return Err(ParseError::UnknownTool(call.name.clone()));
        }
        let code = call.code().ok_or_else(|| {
            ParseError::InvalidToolCall("missing `code` argument".to_string())
        })?;
        let language = Language::from_tag(call.language_tag()).ok_or_else(|| {
            ParseError::InvalidToolCall(format!(
                "unsupported language `{}`",
                call.language_tag()
            ))
        })?;
        calls.push((code, language));
    }

    let from_text = parse(&response.text())?;
    let Some(&(code, language)) = calls.first() else {
        return Ok(from_text);
    };
    let blocks = calls.len() + usize::from(matches!(from_text, Action::Execute { .. }));
    if blocks > 1 {
        return Err(ParseError::MultipleCodeBlocks { count: blocks });
    }

    let (code, reset) = strip_reset_directive(code.trim_end_matches(['\n', '\r']), language);
    if code.trim().is_empty() {
        return Err(ParseError::EmptyCode { language });
    }
    Ok(Action::Execute {
        narration: from_text.narration().to_string(),
        code,
        language,
        reset,
    })
}

/// Split a response into narrative, executable and completion segments
pub fn parse_segments(text: &str) -> Result<Vec<Segment>, ParseError> {
    let mut segments = Vec::new();
    let mut offset = 0;

    while let Some(relative) = text[offset..].find(FENCE) {
        let open = offset + relative;
        let line = text[..open].matches('\n').count() + 1;
        let info_start = open + FENCE.len();
        let (info, body_start) = match text[info_start..].find('\n') {
            Some(newline) => (
                &text[info_start..info_start + newline],
                Some(info_start + newline + 1),
            ),
            None => (&text[info_start..], None),
        };
        let tag = info.split_whitespace().next().unwrap_or("");
        let language = Language::from_tag(tag);

        let close = body_start.and_then(|start| text[start..].find(FENCE).map(|c| (start, c)));
        let Some((body_start, close)) = close else {
            if language.is_some() {
                return Err(ParseError::UnclosedFence { line });
            }
            // Stray backticks in prose
            push_prose(&mut segments, &text[offset..]);
            return Ok(segments);
        };
        push_prose(&mut segments, &text[offset..open]);
        let body = &text[body_start..body_start + close];
        let end = body_start + close + FENCE.len();

        match language {
            Some(language) => segments.push(Segment::Execute {
                code: body.trim_end_matches(['\n', '\r']).to_string(),
                language,
            }),
            None => segments.push(Segment::Narrate(text[open..end].to_string())),
        }
        offset = end;
    }

    push_prose(&mut segments, &text[offset..]);
    Ok(segments)
}

/// Split prose into narrative runs and FINISH markers
fn push_prose(segments: &mut Vec<Segment>, prose: &str) {
    let mut buffer = String::new();
    for line in prose.lines() {
        match finish_marker(line) {
            Some(inline) => {
                flush_narrative(segments, &mut buffer);
                segments.push(Segment::Finish(inline.to_string()));
            }
            None => {
                buffer.push_str(line);
                buffer.push('\n');
            }
        }
    }
    flush_narrative(segments, &mut buffer);
}

fn flush_narrative(segments: &mut Vec<Segment>, buffer: &mut String) {
    let text = buffer.trim();
    if !text.is_empty() {
        segments.push(Segment::Narrate(text.to_string()));
    }
    buffer.clear();
}

fn finish_marker(line: &str) -> Option<&str> {
    let line = line.trim();
    if line == FINISH_MARKER {
        return Some("");
    }
    line.strip_prefix(FINISH_MARKER)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

/// Fold segments into exactly one action
fn fold(segments: Vec<Segment>) -> Result<Action, ParseError> {
    let mut narration = Vec::new();
    let mut executable = Vec::new();
    let mut finished = false;

    for segment in segments {
        match segment {
            Segment::Narrate(text) => narration.push(text),
            Segment::Execute { code, language } => executable.push((code, language)),
            Segment::Finish(inline) => {
                finished = true;
                if !inline.is_empty() {
                    narration.push(inline);
                }
            }
        }
    }

    let narration = narration.join("\n\n");

    if executable.len() > 1 {
        return Err(ParseError::MultipleCodeBlocks {
            count: executable.len(),
        });
    }

    if let Some((code, language)) = executable.pop() {
        let (code, reset) = strip_reset_directive(&code, language);
        if code.trim().is_empty() {
            return Err(ParseError::EmptyCode { language });
        }
        return Ok(Action::Execute {
            narration,
            code,
            language,
            reset,
        });
    }

    if finished {
        Ok(Action::Finish { answer: narration })
    } else {
        Ok(Action::Narrate(narration))
    }
}

fn strip_reset_directive(code: &str, language: Language) -> (String, bool) {
    let mut lines = code.lines();
    let first = lines.next().unwrap_or("").trim();
    let is_directive = first
        .strip_prefix(language.comment_prefix())
        .map(|rest| rest.trim() == RESET_DIRECTIVE)
        .unwrap_or(false);

    if is_directive {
        (lines.collect::<Vec<_>>().join("\n"), true)
    } else {
        (code.to_string(), false)
    }
}
