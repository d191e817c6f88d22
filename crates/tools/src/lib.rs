//! Built-in tools for murmur.
//!
//! Tools give the assistant a way to act beyond a text reply: do math,
//! schedule and cancel reminders, and remember facts about the people it
//! talks to.

pub mod calculator;
pub mod cancel_task;
pub mod schedule_task;
pub mod update_profile;

use std::sync::Arc;

use murmur_core::memory::MemoryStore;
use murmur_core::tool::ToolRegistry;
use murmur_scheduler::TaskScheduler;

pub use calculator::CalculatorTool;
pub use cancel_task::CancelTaskTool;
pub use schedule_task::ScheduleTaskTool;
pub use update_profile::UpdateProfileTool;

/// A registry holding every built-in tool.
pub fn default_registry(
    scheduler: Arc<TaskScheduler>,
    memory: Arc<dyn MemoryStore>,
) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.add(Arc::new(CalculatorTool));
    registry.add(Arc::new(ScheduleTaskTool::new(scheduler.clone())));
    registry.add(Arc::new(CancelTaskTool::new(scheduler)));
    registry.add(Arc::new(UpdateProfileTool::new(memory)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_memory::InMemoryMemoryStore;
    use murmur_scheduler::{InMemoryTaskStore, SchedulerSettings};

    #[test]
    fn default_registry_lists_builtins_sorted() {
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(InMemoryTaskStore::new()),
            SchedulerSettings::default(),
        ));
        let registry = default_registry(scheduler, Arc::new(InMemoryMemoryStore::new()));
        assert_eq!(
            registry.names(),
            vec![
                "calculator",
                "cancel_scheduled_task",
                "schedule_task",
                "update_user_profile"
            ]
        );
        assert!(registry.list().iter().all(|d| d.parameters["type"] == "object"));
    }
}
