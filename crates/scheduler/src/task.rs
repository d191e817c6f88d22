//! Scheduled task model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use murmur_core::message::{ConversationId, MessageRef, TaskId, UserId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a task. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Fired,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "fired" => Ok(Self::Fired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A reminder waiting to be, or already, fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,

    /// The user who asked for the reminder
    pub user_id: UserId,

    pub conversation_id: ConversationId,

    /// Message the reminder replies to when fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<MessageRef>,

    pub due_at: DateTime<Utc>,

    /// What to do, in the user's words
    pub payload: String,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

/// Everything needed to persist a new task; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub origin: Option<MessageRef>,
    pub due_at: DateTime<Utc>,
    pub payload: String,
}

/// Emitted by the scheduling loop once a task has been marked fired.
#[derive(Debug, Clone)]
pub struct FiredTask {
    pub task: ScheduledTask,
    pub fired_at: DateTime<Utc>,
}
