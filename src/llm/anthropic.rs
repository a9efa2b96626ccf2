//! Anthropic Messages API provider.
//!
//! Direct reqwest client; tool declarations map to the API's `tools` array
//! and tool results are folded back into user messages as `tool_result`
//! blocks, which is what the API expects.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role, TokenUsage, ToolCall,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages API client.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.to_string(),
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

// ── Conversion ──────────────────────────────────────────────────────

/// Split history into the system prompt and the alternating message list.
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_parts = Vec::new();
    let mut api_messages: Vec<ApiMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::User => api_messages.push(ApiMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut content = Vec::new();
                if !msg.content.is_empty() {
                    content.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for call in &msg.tool_calls {
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    });
                }
                if !content.is_empty() {
                    api_messages.push(ApiMessage {
                        role: "assistant",
                        content,
                    });
                }
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                };
                // Consecutive tool results merge into one user message.
                match api_messages.last_mut() {
                    Some(last) if last.role == "user" && is_tool_result_batch(&last.content) => {
                        last.content.push(block);
                    }
                    _ => api_messages.push(ApiMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, api_messages)
}

fn is_tool_result_batch(blocks: &[ContentBlock]) -> bool {
    blocks
        .iter()
        .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, messages) = convert_messages(&request.messages);

        let body = ApiRequest {
            model: self.model.clone(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system,
            messages,
            tools: request
                .tools
                .iter()
                .map(|t| ApiTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: e.to_string(),
        })?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(LlmError::AuthFailed {
                provider: "anthropic".to_string(),
            });
        }
        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("HTTP {status}: {message}"),
            });
        }

        let parsed: ApiResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        let mut content_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text } => content_parts.push(text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::ToolResult { .. } => {}
            }
        }

        Ok(CompletionResponse {
            content: if content_parts.is_empty() {
                None
            } else {
                Some(content_parts.join("\n"))
            },
            tool_calls,
            usage: TokenUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }
}
