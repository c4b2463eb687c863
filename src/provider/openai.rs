//! OpenAI-compatible `/chat/completions` adapter
//!
//! Serves OpenAI itself and any compatible endpoint, including Gemini's
//! OpenAI surface. Execution results are sent back as `user` messages.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    decode_arguments, execute_code_parameters, execute_request, validate_base_url, ChatProvider,
    ModelResponse, ProviderConfig, ProviderError, ResponsePart, ToolCall, Usage,
    EXECUTE_CODE_DESCRIPTION, EXECUTE_CODE_TOOL,
};
use crate::conversation::{Conversation, Role};

pub struct OpenAiProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        validate_base_url(&config.base_url)?;
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let api_key = config.require_api_key()?.to_string();
        Ok(Self {
            client: config.http_client()?,
            config,
            api_key,
        })
    }

    pub fn request_body(&self, conversation: &Conversation) -> Value {
        let messages: Vec<Value> = conversation
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User | Role::ExecutionResult => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": turn.content })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
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

/// Decode a `/chat/completions` response
pub fn parse_response(value: &Value) -> Result<ModelResponse, ProviderError> {
    let message = value["choices"]
        .get(0)
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| ProviderError::malformed("response has no choices"))?;

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
                id: call["id"].as_str().map(str::to_string),
                name: name.to_string(),
                arguments: decode_arguments(&function["arguments"])?,
            }));
        }
    }

    Ok(ModelResponse {
        parts,
        usage: Usage {
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        },
        model: value["model"].as_str().unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.config.kind.as_str()
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, conversation: &Conversation) -> Result<ModelResponse, ProviderError> {
        self.config.check_context(conversation)?;

        let url = format!("{}/chat/completions", self.config.base_url);
        debug!(url = %url, model = %self.config.model, turns = conversation.len(), "Calling LLM API");

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(conversation));
        let value = execute_request(request).await?;
        parse_response(&value)
    }
}
