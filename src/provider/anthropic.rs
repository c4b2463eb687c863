//! Anthropic Messages API adapter
//!
//! The system prompt moves to the top-level `system` field and adjacent
//! messages with the same role are merged, since the API requires strict
//! user/assistant alternation.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    execute_code_parameters, execute_request, validate_base_url, ChatProvider, ModelResponse,
    ProviderConfig, ProviderError, ResponsePart, ToolCall, Usage, EXECUTE_CODE_DESCRIPTION,
    EXECUTE_CODE_TOOL,
};
use crate::conversation::{Conversation, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
}

impl AnthropicProvider {
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
        let (system, messages) = convert_messages(conversation);

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if self.config.native_tools {
            body["tools"] = json!([{
                "name": EXECUTE_CODE_TOOL,
                "description": EXECUTE_CODE_DESCRIPTION,
                "input_schema": execute_code_parameters(),
            }]);
        }
        body
    }
}

/// Split out the system prompt and merge same-role neighbours
fn convert_messages(conversation: &Conversation) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<&str> = Vec::new();
    let mut merged: Vec<(&'static str, String)> = Vec::new();

    for turn in conversation.iter() {
        let role = match turn.role {
            Role::System => {
                system.push(&turn.content);
                continue;
            }
            Role::User | Role::ExecutionResult => "user",
            Role::Assistant => "assistant",
        };
        match merged.last_mut() {
            Some((last_role, content)) if *last_role == role => {
                content.push_str("\n\n");
                content.push_str(&turn.content);
            }
            _ => merged.push((role, turn.content.clone())),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    let messages = merged
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();
    (system, messages)
}

/// Decode a `/v1/messages` response
pub fn parse_response(value: &Value) -> Result<ModelResponse, ProviderError> {
    let blocks = value["content"]
        .as_array()
        .ok_or_else(|| ProviderError::malformed("response has no content blocks"))?;

    let mut parts = Vec::new();
    for block in blocks {
        match block["type"].as_str().unwrap_or("") {
            "text" => {
                if let Some(text) = block["text"].as_str() {
                    parts.push(ResponsePart::Text(text.to_string()));
                }
            }
            "tool_use" => {
                let name = block["name"]
                    .as_str()
                    .ok_or_else(|| ProviderError::malformed("tool_use block without a name"))?;
                parts.push(ResponsePart::ToolCall(ToolCall {
                    id: block["id"].as_str().map(str::to_string),
                    name: name.to_string(),
                    arguments: block["input"].clone(),
                }));
            }
            _ => {}
        }
    }

    Ok(ModelResponse {
        parts,
        usage: Usage {
            prompt_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        },
        model: value["model"].as_str().unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, conversation: &Conversation) -> Result<ModelResponse, ProviderError> {
        self.config.check_context(conversation)?;

        let url = format!("{}/v1/messages", self.config.base_url);
        debug!(url = %url, model = %self.config.model, "Calling Anthropic Messages API");

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(conversation));
        let value = execute_request(request).await?;
        parse_response(&value)
    }
}
