//! Reminder scheduling tool.
//!
//! The model calls this to defer work: at the due time the scheduler fires
//! the task back into the conversation it came from and the assistant
//! executes the description autonomously.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use murmur_core::error::ToolError;
use murmur_core::tool::{Tool, ToolContext, ToolResult};
use murmur_scheduler::{NewTask, TaskScheduler, humanize};
use serde_json::{Value, json};
use tracing::warn;

/// Longest accepted task description, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

pub struct ScheduleTaskTool {
    scheduler: Arc<TaskScheduler>,
}

impl ScheduleTaskTool {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

/// Integer argument that may be absent or sent as a float.
pub(crate) fn int_arg(arguments: &Value, key: &str) -> Result<i64, ToolError> {
    match &arguments[key] {
        Value::Null => Ok(0),
        v => v
            .as_i64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
            .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' must be an integer"))),
    }
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a task to run later, autonomously. At the due time you will be woken up \
         in this conversation and can use all your tools again. Use it for reminders, \
         deferred lookups and timed messages, e.g. 'remind me to take the bins out in 2 hours'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_description": {
                    "type": "string",
                    "description": "Clear description of what to do when the task fires, e.g. 'Remind the user to take the bins out'"
                },
                "delay_minutes": {
                    "type": "integer",
                    "description": "Minutes to wait before running the task (e.g. 120 for two hours)"
                },
                "delay_hours": {
                    "type": "integer",
                    "description": "Hours to wait before running the task (e.g. 24 for tomorrow)"
                }
            },
            "required": ["task_description"]
        })
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let Some(requester) = &ctx.requester else {
            return Ok(ToolResult::error("no requesting user for this task"));
        };

        let description = arguments["task_description"].as_str().map(str::trim).unwrap_or("");
        if description.is_empty() {
            return Ok(ToolResult::error("task_description must not be empty"));
        }
        let length = description.chars().count();
        if length > MAX_DESCRIPTION_CHARS {
            return Ok(ToolResult::error(format!(
                "task_description is {length} characters long; the limit is {MAX_DESCRIPTION_CHARS}"
            )));
        }

        let minutes = int_arg(&arguments, "delay_minutes")?;
        let hours = int_arg(&arguments, "delay_hours")?;
        let bounds = self.scheduler.settings().delay_bounds;
        let delay = match bounds.validate(minutes, hours) {
            Ok(delay) => delay,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };

        let task = NewTask {
            user_id: requester.id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            origin: ctx.origin.clone(),
            due_at: Utc::now() + delay,
            payload: description.to_string(),
        };

        match self.scheduler.schedule(&ctx.chain, task).await {
            Ok(stored) => Ok(ToolResult::ok(json!({
                "success": true,
                "task_id": stored.id.0,
                "execute_at": stored.due_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                "delay": humanize(delay.num_minutes()),
            }))),
            Err(e) => {
                warn!(user_id = %requester.id, error = %e, "Task not scheduled");
                Ok(ToolResult::error(e.to_string()))
            }
        }
    }
}
