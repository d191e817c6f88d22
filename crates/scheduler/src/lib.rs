//! Reminder scheduling: durable delayed tasks fired independently of any
//! live conversation.
//!
//! A task is created by the `schedule_task` tool, persisted as `pending`,
//! and fired by the [`TaskScheduler`] loop when due. Firing emits a
//! [`FiredTask`] that the conversation pipeline turns into a reply.

pub mod delay;
pub mod scheduler;
pub mod store;
pub mod task;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use delay::{DelayBounds, humanize};
pub use scheduler::{SchedulerSettings, TaskScheduler};
pub use store::{InMemoryTaskStore, TaskStore};
pub use task::{FiredTask, NewTask, ScheduledTask, TaskStatus};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTaskStore;
