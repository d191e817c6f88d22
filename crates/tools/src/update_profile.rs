//! Lets the model record durable facts about the user it is talking to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use murmur_core::error::ToolError;
use murmur_core::memory::MemoryStore;
use murmur_core::tool::{Tool, ToolContext, ToolResult};
use serde_json::{Value, json};
use tracing::info;

const MAX_FACTS_PER_CALL: usize = 20;
const MAX_VALUE_CHARS: usize = 200;

pub struct UpdateProfileTool {
    memory: Arc<dyn MemoryStore>,
}

impl UpdateProfileTool {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }
}

/// `"Favourite Food"` -> `favourite_food`
fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_facts(arguments: &Value) -> Result<BTreeMap<String, String>, ToolError> {
    let object = arguments["facts"]
        .as_object()
        .ok_or_else(|| ToolError::InvalidArguments("'facts' must be an object".into()))?;

    let mut facts = BTreeMap::new();
    for (key, value) in object {
        let key = normalize_key(key);
        let value = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => continue,
            other => other.to_string(),
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        facts.insert(key, value.chars().take(MAX_VALUE_CHARS).collect());
    }
    Ok(facts)
}

#[async_trait]
impl Tool for UpdateProfileTool {
    fn name(&self) -> &str {
        "update_user_profile"
    }

    fn description(&self) -> &str {
        "Record USEFUL, durable facts about the author to personalise future conversations: \
         identity (first name, age, job, location), communication preferences, lasting projects \
         and interests, specific constraints. Do not record passing opinions, one-off actions, \
         questions asked, general knowledge, or anything about other people."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "facts": {
                    "type": "object",
                    "description": "Facts to store as key/value pairs, e.g. {\"city\": \"Lyon\", \"job\": \"nurse\"}",
                    "additionalProperties": { "type": "string" }
                }
            },
            "required": ["facts"]
        })
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let Some(requester) = &ctx.requester else {
            return Ok(ToolResult::error("no author to attach these facts to"));
        };

        let facts = parse_facts(&arguments)?;
        if facts.is_empty() {
            return Ok(ToolResult::error("no facts to record"));
        }
        if facts.len() > MAX_FACTS_PER_CALL {
            return Ok(ToolResult::error(format!(
                "too many facts at once ({}, limit {MAX_FACTS_PER_CALL})",
                facts.len()
            )));
        }

        let keys: Vec<String> = facts.keys().cloned().collect();
        let profile = self
            .memory
            .update_facts(&requester.id, facts)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        info!(user_id = %requester.id, keys = ?keys, "Profile updated");
        Ok(ToolResult::ok(json!({
            "success": true,
            "updated": keys,
            "total_facts": profile.facts.len(),
        })))
    }
}
