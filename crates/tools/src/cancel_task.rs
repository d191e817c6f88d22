//! Cancels a reminder on behalf of the user who asked for it.

use std::sync::Arc;

use async_trait::async_trait;
use murmur_core::error::{ScheduleError, ToolError};
use murmur_core::message::TaskId;
use murmur_core::tool::{Tool, ToolContext, ToolResult};
use murmur_scheduler::TaskScheduler;
use serde_json::{Value, json};

use crate::schedule_task::int_arg;

pub struct CancelTaskTool {
    scheduler: Arc<TaskScheduler>,
}

impl CancelTaskTool {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CancelTaskTool {
    fn name(&self) -> &str {
        "cancel_scheduled_task"
    }

    fn description(&self) -> &str {
        "Cancel a previously scheduled task. Only the user who asked for the task can cancel it. \
         You need the task ID returned when the task was created."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "integer",
                    "description": "ID of the task to cancel, as returned by schedule_task"
                }
            },
            "required": ["task_id"]
        })
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let Some(requester) = &ctx.requester else {
            return Ok(ToolResult::error("no requesting user to cancel for"));
        };
        if arguments["task_id"].is_null() {
            return Err(ToolError::InvalidArguments("missing 'task_id' argument".into()));
        }
        let id = TaskId(int_arg(&arguments, "task_id")?);

        match self.scheduler.cancel(id, &requester.id).await {
            Ok(task) => Ok(ToolResult::ok(json!({
                "success": true,
                "task_id": task.id.0,
                "cancelled": task.payload,
            }))),
            Err(ScheduleError::Forbidden { .. }) => Ok(ToolResult::error(format!(
                "task {id} belongs to another user; only its author can cancel it"
            ))),
            Err(e @ ScheduleError::NotFound(_)) => Ok(ToolResult::error(e.to_string())),
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
