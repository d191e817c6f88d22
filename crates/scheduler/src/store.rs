//! Task persistence.
//!
//! Every mutation is a single atomic step on one task row: there is no lock
//! spanning several tasks or users.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_core::error::ScheduleError;
use murmur_core::message::{TaskId, UserId};
use tokio::sync::RwLock;

use crate::task::{NewTask, ScheduledTask, TaskStatus};

/// Trait for scheduled-task storage.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a pending task, unless the user already has `max_pending`
    /// pending tasks.
    async fn insert(&self, task: NewTask, max_pending: usize) -> Result<ScheduledTask, ScheduleError>;

    /// Gets a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, ScheduleError>;

    /// Transition `pending -> fired`. Returns the task only if this call made
    /// the transition.
    async fn mark_fired(&self, id: TaskId) -> Result<Option<ScheduledTask>, ScheduleError>;

    /// Transition `pending -> cancelled` on behalf of `requester`.
    async fn cancel(&self, id: TaskId, requester: &UserId) -> Result<ScheduledTask, ScheduleError>;

    /// Pending tasks of one user, soonest first.
    async fn list_pending(&self, user_id: &UserId) -> Result<Vec<ScheduledTask>, ScheduleError>;

    /// All pending tasks ordered by due time, then creation order.
    async fn all_pending(&self) -> Result<Vec<ScheduledTask>, ScheduleError>;

    async fn count_pending(&self, user_id: &UserId) -> Result<usize, ScheduleError>;

    /// Delete terminal tasks whose status changed before `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, ScheduleError>;
}

/// Error for a failed cancel, given what the store knows about the task.
pub(crate) fn cancel_failure(
    id: TaskId,
    existing: Option<&ScheduledTask>,
    requester: &UserId,
) -> ScheduleError {
    match existing {
        Some(task) if &task.user_id != requester => ScheduleError::Forbidden {
            task_id: id,
            requester: requester.clone(),
        },
        _ => ScheduleError::NotFound(id),
    }
}

/// Tasks kept in a map, for tests and runs without persistence.
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<BTreeMap<TaskId, ScheduledTask>>>,
    next_id: AtomicI64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn pending_of<'a>(
    tasks: &'a BTreeMap<TaskId, ScheduledTask>,
    user_id: &'a UserId,
) -> impl Iterator<Item = &'a ScheduledTask> {
    tasks
        .values()
        .filter(move |t| t.status == TaskStatus::Pending && &t.user_id == user_id)
}

fn by_due(tasks: &mut [ScheduledTask]) {
    tasks.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: NewTask, max_pending: usize) -> Result<ScheduledTask, ScheduleError> {
        let mut tasks = self.tasks.write().await;

        let pending = pending_of(&tasks, &task.user_id).count();
        if pending >= max_pending {
            return Err(ScheduleError::QuotaExceeded {
                user_id: task.user_id,
                pending,
                limit: max_pending,
            });
        }

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let stored = ScheduledTask {
            id,
            user_id: task.user_id,
            conversation_id: task.conversation_id,
            origin: task.origin,
            due_at: task.due_at,
            payload: task.payload,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        tasks.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, ScheduleError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn mark_fired(&self, id: TaskId) -> Result<Option<ScheduledTask>, ScheduleError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Fired;
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel(&self, id: TaskId, requester: &UserId) -> Result<ScheduledTask, ScheduleError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending && &task.user_id == requester => {
                task.status = TaskStatus::Cancelled;
                task.updated_at = Utc::now();
                Ok(task.clone())
            }
            other => Err(cancel_failure(id, other.as_deref(), requester)),
        }
    }

    async fn list_pending(&self, user_id: &UserId) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<_> = pending_of(&tasks, user_id).cloned().collect();
        by_due(&mut out);
        Ok(out)
    }

    async fn all_pending(&self) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<_> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        by_due(&mut out);
        Ok(out)
    }

    async fn count_pending(&self, user_id: &UserId) -> Result<usize, ScheduleError> {
        Ok(pending_of(&*self.tasks.read().await, user_id).count())
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, ScheduleError> {
        let mut tasks = self.tasks.write().await;
        let len_before = tasks.len();
        tasks.retain(|_, t| !(t.status.is_terminal() && t.updated_at < before));
        Ok((len_before - tasks.len()) as u64)
    }
}
