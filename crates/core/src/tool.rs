//! Tool trait: the abstraction over assistant capabilities.
//!
//! Tools are what let the model act: evaluate arithmetic, schedule a
//! reminder, remember a fact about a user. A tool never touches the context
//! window; it returns a JSON payload and the orchestrator appends it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::message::{Author, ConversationId, MessageRef};
use crate::provider::ToolDefinition;

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// JSON payload handed back to the model
    pub payload: serde_json::Value,
}

impl ToolResult {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    /// A failed result whose payload is `{"error": message}`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: serde_json::json!({ "error": message.into() }),
        }
    }
}

/// Counts tasks scheduled by one orchestration cycle.
///
/// Shared by every tool call of the cycle, including calls running
/// concurrently, so claims go through a single atomic.
#[derive(Debug, Default)]
pub struct ChainCounter {
    claimed: AtomicU32,
}

impl ChainCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one slot. Returns false once `cap` slots are taken.
    pub fn try_claim(&self, cap: u32) -> bool {
        self.claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give back a slot whose scheduling failed for another reason.
    pub fn release(&self) {
        let _ = self
            .claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn claimed(&self) -> u32 {
        self.claimed.load(Ordering::Acquire)
    }
}

/// What a tool knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,

    /// The user whose message started this cycle, if any
    pub requester: Option<Author>,

    /// Platform reference of that message
    pub origin: Option<MessageRef>,

    pub chain: Arc<ChainCounter>,
}

impl ToolContext {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            requester: None,
            origin: None,
            chain: Arc::new(ChainCounter::new()),
        }
    }

    pub fn with_requester(mut self, requester: Author) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn with_origin(mut self, origin: MessageRef) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// The core Tool trait.
///
/// Each tool (calculator, schedule_task, update_user_profile, etc.)
/// implements this trait and is registered in the [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "calculator").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, shared across conversations.
///
/// Mutation takes `&self` so tools can be plugged in or out while the
/// assistant runs; `list()` always reflects every completed `add`/`remove`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn add(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "Replaced registered tool");
        }
    }

    /// Remove a tool by name. Returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All tool definitions, sorted by name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut defs: Vec<_> = tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        description: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            self.description
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(arguments["text"].clone()))
        }
    }

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "named"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(serde_json::Value::Null))
        }
    }

    #[test]
    fn registry_add_and_lookup() {
        let registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool { description: "v1" }));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn re_adding_replaces() {
        let registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool { description: "v1" }));
        registry.add(Arc::new(EchoTool { description: "v2" }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].description, "v2");
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool { description: "v1" }));
        assert!(registry.remove("echo"));
        assert!(!registry.remove("echo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let registry = ToolRegistry::new();
        registry.add(Arc::new(NamedTool("zeta")));
        registry.add(Arc::new(NamedTool("alpha")));
        registry.add(Arc::new(NamedTool("mid")));
        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(registry.names(), vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn execute_through_registry() {
        let registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool { description: "v1" }));
        let ctx = ToolContext::new(ConversationId::from("c1"));
        let tool = registry.get("echo").unwrap();
        let result = tool
            .execute(serde_json::json!({"text": "hello world"}), &ctx)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.payload, "hello world");
    }

    #[test]
    fn error_result_wraps_message() {
        let r = ToolResult::error("boom");
        assert!(!r.success);
        assert_eq!(r.payload, serde_json::json!({"error": "boom"}));
    }

    #[test]
    fn chain_counter_stops_at_cap() {
        let chain = ChainCounter::new();
        for _ in 0..5 {
            assert!(chain.try_claim(5));
        }
        assert!(!chain.try_claim(5));
        chain.release();
        assert!(chain.try_claim(5));
        assert_eq!(chain.claimed(), 5);
    }
}
