//! LLM provider adapters
//!
//! A [`ChatProvider`] turns the whole [`Conversation`] into one model request
//! and hands back a [`ModelResponse`]. Providers never decide what is code and
//! what is narrative; that is the interpreter's job.
//!
//! ```text
//! Conversation ──render──▶ provider wire format ──HTTP──▶ model
//!                                                           │
//! ModelResponse { parts: [Text | ToolCall], usage } ◀──parse┘
//! ```
//!
//! Adapters are stateless after construction and share one pooled
//! `reqwest::Client`, so a single `Arc<dyn ChatProvider>` can serve many
//! sessions at once.

pub mod anthropic;
pub mod error;
pub mod ollama;
pub mod openai;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::Conversation;

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, ProviderErrorKind};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Name of the native code execution tool
pub const EXECUTE_CODE_TOOL: &str = "execute_code";

/// Model used when nothing is configured
pub const DEFAULT_MODEL_SPEC: &str = "gemini/gemini-2.5-flash-lite";

/// Chat backend that can answer a conversation
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name for logs and metrics ("ollama", "openai", ...)
    fn name(&self) -> &str;

    /// Model identifier sent with every request
    fn model(&self) -> &str;

    /// Send the full conversation and return the model's reply
    async fn send(&self, conversation: &Conversation) -> Result<ModelResponse, ProviderError>;
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn code(&self) -> Option<&str> {
        self.arguments.get("code").and_then(Value::as_str)
    }

    /// Requested language tag, `python` when the model left it out
    pub fn language_tag(&self) -> &str {
        self.arguments
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("python")
    }
}

/// One piece of a model reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePart {
    Text(String),
    ToolCall(ToolCall),
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Closed representation of a provider reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub parts: Vec<ResponsePart>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub model: String,
}

impl ModelResponse {
    pub fn new(parts: Vec<ResponsePart>) -> Self {
        Self {
            parts,
            ..Self::default()
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(vec![ResponsePart::Text(text.into())])
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ResponsePart::Text(t) => Some(t.as_str()),
                ResponsePart::ToolCall(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|p| match p {
            ResponsePart::ToolCall(call) => Some(call),
            ResponsePart::Text(_) => None,
        })
    }

    /// Text with `execute_code` tool calls rendered as fenced blocks
    ///
    /// This is what gets stored as the assistant turn, so the transcript
    /// reads the same whichever way the model asked to run code.
    pub fn transcript(&self) -> String {
        let mut pieces = Vec::new();
        for part in &self.parts {
            match part {
                ResponsePart::Text(text) if !text.trim().is_empty() => {
                    pieces.push(text.trim_end().to_string())
                }
                ResponsePart::Text(_) => {}
                ResponsePart::ToolCall(call) if call.name == EXECUTE_CODE_TOOL => {
                    if let Some(code) = call.code() {
                        pieces.push(format!(
                            "```{}\n{}\n```",
                            call.language_tag(),
                            code.trim_end()
                        ));
                    }
                }
                // Kept visible; interpretation rejects the call
                ResponsePart::ToolCall(call) => {
                    pieces.push(format!("(call to unknown tool `{}`)", call.name))
                }
            }
        }
        pieces.join("\n\n")
    }
}

/// Which wire protocol a model speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "ollama" => Some(ProviderKind::Ollama),
            "openai" => Some(ProviderKind::OpenAi),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "http://localhost:11434",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            ProviderKind::Anthropic => "https://api.anthropic.com",
        }
    }

    /// Environment variable holding the credential, if one is needed
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Ollama => None,
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable provider settings, credentials included
#[derive(Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Model name without the provider prefix
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Refuse to send conversations longer than this many characters
    pub context_window_chars: Option<usize>,
    /// Advertise the `execute_code` tool in requests
    pub native_tools: bool,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("context_window_chars", &self.context_window_chars)
            .field("native_tools", &self.native_tools)
            .finish()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::from_model_spec(DEFAULT_MODEL_SPEC)
    }
}

impl ProviderConfig {
    /// Parse a `provider/model` spec; bare names are Ollama models
    ///
    /// ```ignore
    /// let config = ProviderConfig::from_model_spec("gemini/gemini-2.5-flash-lite");
    /// assert_eq!(config.kind, ProviderKind::Gemini);
    /// ```
    pub fn from_model_spec(spec: &str) -> Self {
        let (kind, model) = match spec.split_once('/') {
            Some((prefix, rest)) => match ProviderKind::from_prefix(prefix) {
                Some(kind) => (kind, rest.to_string()),
                None => (ProviderKind::Ollama, spec.to_string()),
            },
            None => (ProviderKind::Ollama, spec.to_string()),
        };

        Self {
            kind,
            model,
            base_url: kind.default_base_url().to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
            temperature: 0.0,
            max_tokens: 4096,
            context_window_chars: None,
            native_tools: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fill in the API key from the process environment
    pub fn resolve_api_key(self) -> Result<Self, ProviderError> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    /// Fill in the API key using `lookup` for environment variables
    pub fn resolve_api_key_with(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        if self.api_key.is_some() {
            return Ok(self);
        }
        let Some(var) = self.kind.api_key_env() else {
            return Ok(self);
        };
        match lookup(var).filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                self.api_key = Some(key.trim().to_string());
                Ok(self)
            }
            None => Err(ProviderError::configuration(format!(
                "{} is not set; it is required for {} models",
                var, self.kind
            ))),
        }
    }

    /// Fail fast when the conversation cannot fit the context window
    pub fn check_context(&self, conversation: &Conversation) -> Result<(), ProviderError> {
        if let Some(limit) = self.context_window_chars {
            let chars = conversation.content_chars();
            if chars > limit {
                return Err(ProviderError::context_overflow(chars, limit));
            }
        }
        Ok(())
    }

    fn require_api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::configuration(format!("no API key configured for {}", self.kind))
        })
    }

    fn http_client(&self) -> Result<reqwest::Client, ProviderError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProviderError::configuration(format!("failed to build HTTP client: {}", e)))
    }
}

/// Build the adapter matching `config.kind`
pub fn build_provider(config: ProviderConfig) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let provider: Arc<dyn ChatProvider> = match config.kind {
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(config)?),
        ProviderKind::OpenAi | ProviderKind::Gemini => Arc::new(OpenAiProvider::new(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)?),
    };
    Ok(provider)
}

/// Validate a base URL
///
/// HTTPS is always allowed. Plain HTTP only for loopback hosts, since the
/// API key would otherwise travel in cleartext.
pub fn validate_base_url(base_url: &str) -> Result<(), ProviderError> {
    let parsed = reqwest::Url::parse(base_url).map_err(|e| {
        ProviderError::configuration(format!("invalid base_url '{}': {}", base_url, e))
    })?;

    let host = parsed.host_str().unwrap_or("");
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1") => Ok(()),
        "http" => Err(ProviderError::configuration(format!(
            "HTTP is only permitted for localhost (base_url: '{}'); use HTTPS",
            base_url
        ))),
        scheme => Err(ProviderError::configuration(format!(
            "unsupported URL scheme '{}' in base_url '{}'",
            scheme, base_url
        ))),
    }
}

/// JSON schema of the `execute_code` tool
pub fn execute_code_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "language": {
                "type": "string",
                "enum": ["python", "bash", "javascript"],
                "description": "The programming language to use"
            },
            "code": {
                "type": "string",
                "description": "The code to execute"
            }
        },
        "required": ["language", "code"]
    })
}

pub const EXECUTE_CODE_DESCRIPTION: &str = "Execute code in the session sandbox and return its \
exit code, stdout and stderr. Files written persist for the rest of the session.";

/// Send a prepared request and decode the JSON body
///
/// Non-success statuses become classified [`ProviderError`]s.
pub(crate) async fn execute_request(request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
    let response = request.send().await.map_err(|e| ProviderError::network(&e))?;
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = response.text().await.map_err(|e| ProviderError::network(&e))?;

    if !status.is_success() {
        return Err(ProviderError::from_status(status.as_u16(), &body)
            .with_retry_after_header(retry_after.as_deref()));
    }

    if body.trim().is_empty() {
        return Err(ProviderError::malformed("empty response body"));
    }

    serde_json::from_str(&body)
        .map_err(|e| ProviderError::malformed(format!("response is not valid JSON: {}", e)))
}

/// Decode tool call arguments that may arrive as an object or a JSON string
pub(crate) fn decode_arguments(raw: &Value) -> Result<Value, ProviderError> {
    match raw {
        Value::String(s) => serde_json::from_str(s).map_err(|e| {
            ProviderError::malformed(format!("tool call arguments are not valid JSON: {}", e))
        }),
        Value::Null => Ok(Value::Object(Default::default())),
        other => Ok(other.clone()),
    }
}
