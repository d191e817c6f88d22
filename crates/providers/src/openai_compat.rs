//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, Together AI and any other
//! endpoint exposing `/chat/completions` with function calling.
//!
//! Tool calls travel on the tool-role messages that answer them, so the
//! wire conversion rebuilds the assistant turn the API expects: every run
//! of consecutive tool messages is preceded by one synthetic assistant
//! message listing their calls.

use std::time::Duration;

use async_trait::async_trait;
use murmur_core::error::ProviderError;
use murmur_core::message::{Component, ImageDetail, Message, Role, ToolCallRecord};
use murmur_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Back-off suggested when a 429 carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// An OpenAI-compatible chat-completions provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider. An empty `api_key` sends no `Authorization` header.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", api_key, 60)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Result<Self, ProviderError> {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "",
            120,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len());
        let mut i = 0;

        while i < messages.len() {
            let m = &messages[i];
            if m.role == Role::Tool && m.tool_call.is_some() {
                let run: Vec<&Message> = messages[i..]
                    .iter()
                    .take_while(|t| t.role == Role::Tool && t.tool_call.is_some())
                    .collect();

                out.push(ApiMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(
                        run.iter()
                            .filter_map(|t| t.tool_call.as_ref())
                            .map(ApiToolCall::from_record)
                            .collect(),
                    ),
                    tool_call_id: None,
                });
                for t in &run {
                    out.push(ApiMessage {
                        role: "tool".into(),
                        content: Some(ApiContent::Text(t.text())),
                        tool_calls: None,
                        tool_call_id: t.tool_call_id().map(String::from),
                    });
                }
                i += run.len();
                continue;
            }

            let role = match m.role {
                Role::System | Role::Developer => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                // A tool message without its call cannot be paired; pass the
                // payload along as plain user text.
                Role::Tool => "user",
            };
            out.push(ApiMessage {
                role: role.into(),
                content: Some(Self::to_api_content(m)),
                tool_calls: None,
                tool_call_id: None,
            });
            i += 1;
        }

        out
    }

    /// Plain text unless the message carries images, which need content parts.
    fn to_api_content(message: &Message) -> ApiContent {
        if !message.has_image() {
            return ApiContent::Text(message.text());
        }
        let parts = message
            .components()
            .iter()
            .filter_map(|c| match c {
                Component::Image { url, detail } => Some(ApiContentPart::ImageUrl {
                    image_url: ApiImageUrl {
                        url: url.clone(),
                        detail: *detail,
                    },
                }),
                other => other.render().map(|text| ApiContentPart::Text { text }),
            })
            .collect();
        ApiContent::Parts(parts)
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": false,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_completion_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }
}

/// Map a non-success status to a provider error.
fn status_error(status: u16, retry_after: Option<u64>, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        404 => ProviderError::ModelNotFound(body),
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Turn the first choice of an API response into a provider response.
fn into_provider_response(api_response: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(ApiToolCall::into_record)
        .collect();

    let content = match choice.message.content {
        Some(ApiContent::Text(text)) => text,
        Some(ApiContent::Parts(parts)) => parts
            .into_iter()
            .filter_map(|p| match p {
                ApiContentPart::Text { text } => Some(text),
                ApiContentPart::ImageUrl { .. } => None,
            })
            .collect(),
        None => String::new(),
    };

    let usage = api_response.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    Ok(ProviderResponse {
        content,
        tool_calls,
        usage,
        model: api_response.model,
    })
}

#[async_trait]
impl murmur_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending completion request"
        );

        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "Provider returned error");
            return Err(status_error(status.as_u16(), retry_after, error_body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        into_provider_response(api_response)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        Ok(response.status().is_success())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<ApiContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiContentPart>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentPart {
    Text { text: String },
    ImageUrl { image_url: ApiImageUrl },
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiImageUrl {
    url: String,
    #[serde(default)]
    detail: ImageDetail,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

impl ApiToolCall {
    fn from_record(record: &ToolCallRecord) -> Self {
        Self {
            id: record.id.clone(),
            r#type: "function".into(),
            function: ApiFunction {
                name: record.name.clone(),
                arguments: record.arguments.to_string(),
            },
        }
    }

    /// Arguments arrive as a JSON string; malformed JSON is kept as a string
    /// value so the tool can reject it.
    fn into_record(self) -> ToolCallRecord {
        let arguments = serde_json::from_str(&self.function.arguments)
            .unwrap_or(serde_json::Value::String(self.function.arguments));
        ToolCallRecord {
            id: self.id,
            name: self.function.name,
            arguments,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
