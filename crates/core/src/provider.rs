//! Provider trait: the abstraction over language-model backends.
//!
//! A Provider sends an ordered message list plus tool schemas to a model and
//! returns either final text or one or more tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Message, ToolCallRecord};

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// The conversation messages, oldest first
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 2.0 = most random)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete response from a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Generated text, empty when the model only requested tools
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the model, in the order given
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    #[serde(default)]
    pub model: String,
}

impl ProviderResponse {
    /// A final-text response, handy for tests and scripted providers.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRecord>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// The core Provider trait.
///
/// The orchestrator calls `complete()` without knowing which backend is
/// behind it. Deadlines and cancellation are applied by the caller.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_temperature_defaults() {
        let req: ProviderRequest =
            serde_json::from_str(r#"{"model":"gpt-4o-mini","messages":[]}"#).unwrap();
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(req.tools.is_empty());
    }

    #[test]
    fn response_constructors() {
        assert!(!ProviderResponse::text("hi").wants_tools());
        let r = ProviderResponse::tool_calls(vec![ToolCallRecord {
            id: "c1".into(),
            name: "calculator".into(),
            arguments: serde_json::json!({}),
        }]);
        assert!(r.wants_tools());
        assert!(r.content.is_empty());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
        });
        total.add(&Usage {
            prompt_tokens: 5,
            completion_tokens: 1,
            total_tokens: 6,
        });
        assert_eq!(total.total_tokens, 18);
    }
}
