//! Ollama `/api/chat` adapter
//!
//! Local models, no credentials. Execution results go back with the `tool`
//! role, which Ollama's chat templates render as tool output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    decode_arguments, execute_code_parameters, execute_request, validate_base_url, ChatProvider,
    ModelResponse, ProviderConfig, ProviderError, ResponsePart, ToolCall, Usage,
    EXECUTE_CODE_DESCRIPTION, EXECUTE_CODE_TOOL,
};
use crate::conversation::{Conversation, Role};

/// Context size requested from Ollama, in tokens
const NUM_CTX: usize = 8192;

/// Rough characters-per-token ratio used to derive the context window
const CHARS_PER_TOKEN: usize = 4;

/// A message in an Ollama chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
}

/// Client for Ollama's /api/chat endpoint
pub struct OllamaProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OllamaProvider {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        validate_base_url(&config.base_url)?;
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        if config.context_window_chars.is_none() {
            config.context_window_chars = Some(NUM_CTX * CHARS_PER_TOKEN);
        }
        Ok(Self {
            client: config.http_client()?,
            config,
        })
    }

    /// Build the request body for a conversation
    pub fn request_body(&self, conversation: &Conversation) -> Value {
        let messages: Vec<ChatMessage> = conversation
            .iter()
            .map(|turn| ChatMessage {
                role: match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::ExecutionResult => "tool",
                }
                .to_string(),
                content: turn.content.clone(),
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": self.config.temperature,
                "num_ctx": NUM_CTX,
            }
        });

        if self.config.native_tools {
            body["tools"] = json!([{
                "type": "function",
                "function": {
                    "name": EXECUTE_CODE_TOOL,
                    "description": EXECUTE_CODE_DESCRIPTION,
                    "parameters": execute_code_parameters(),
                }
            }]);
        }
        body
    }
}

/// Decode an `/api/chat` response
pub fn parse_response(value: &Value) -> Result<ModelResponse, ProviderError> {
    let message = value
        .get("message")
        .ok_or_else(|| ProviderError::malformed("response has no `message` field"))?;

    let mut parts = Vec::new();
    if let Some(content) = message.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            parts.push(ResponsePart::Text(content.to_string()));
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = &call["function"];
            let name = function["name"]
                .as_str()
                .ok_or_else(|| ProviderError::malformed("tool call without a name"))?;
            parts.push(ResponsePart::ToolCall(ToolCall {
                id: None,
                name: name.to_string(),
                arguments: decode_arguments(&function["arguments"])?,
            }));
        }
    }

    Ok(ModelResponse {
        parts,
        usage: Usage {
            prompt_tokens: value["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["eval_count"].as_u64().unwrap_or(0) as u32,
        },
        model: value["model"].as_str().unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, conversation: &Conversation) -> Result<ModelResponse, ProviderError> {
        self.config.check_context(conversation)?;

        let endpoint = format!("{}/api/chat", self.config.base_url);
        debug!(endpoint = %endpoint, turns = conversation.len(), "Sending chat request");

        let request = self.client.post(&endpoint).json(&self.request_body(conversation));
        let value = execute_request(request).await?;
        parse_response(&value)
    }
}
