//! The task scheduler service and its background firing loop.
//!
//! Pending tasks are mirrored in an in-process queue ordered by
//! `(due_at, id)`. The loop sleeps until the head of that queue is due (or a
//! new task wakes it), marks the task fired in the store, and only then hands
//! it to the conversation pipeline.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_config::SchedulerConfig;
use murmur_core::error::ScheduleError;
use murmur_core::event::{DomainEvent, EventBus};
use murmur_core::message::{TaskId, UserId};
use murmur_core::tool::ChainCounter;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delay::DelayBounds;
use crate::store::TaskStore;
use crate::task::{FiredTask, NewTask, ScheduledTask};

/// Scheduler policy.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Tasks one orchestration cycle may create
    pub chain_cap: u32,
    pub max_pending_per_user: usize,
    pub delay_bounds: DelayBounds,
    /// How long fired and cancelled tasks are kept
    pub retention: chrono::Duration,
    pub purge_interval: Duration,
    /// Pause after a storage failure
    pub retry_backoff: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            chain_cap: 5,
            max_pending_per_user: 10,
            delay_bounds: DelayBounds::default(),
            retention: chrono::Duration::days(1),
            purge_interval: Duration::from_secs(24 * 60 * 60),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            chain_cap: config.chain_cap,
            max_pending_per_user: config.max_pending_per_user,
            delay_bounds: DelayBounds {
                min_minutes: config.min_delay_minutes,
                max_minutes: config.max_delay_minutes,
            },
            retention: chrono::Duration::days(config.retention_days),
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            ..Self::default()
        }
    }
}

type QueueKey = (DateTime<Utc>, TaskId);

/// Owns the pending-task queue and the loop that fires it.
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    settings: SchedulerSettings,
    queue: Mutex<BTreeSet<QueueKey>>,
    wake: Notify,
    events: Option<Arc<EventBus>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            settings,
            queue: Mutex::new(BTreeSet::new()),
            wake: Notify::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Persist a new pending task created during the cycle owning `chain`.
    pub async fn schedule(
        &self,
        chain: &ChainCounter,
        task: NewTask,
    ) -> Result<ScheduledTask, ScheduleError> {
        if !chain.try_claim(self.settings.chain_cap) {
            return Err(ScheduleError::ChainLimitExceeded {
                cap: self.settings.chain_cap,
            });
        }

        let stored = match self
            .store
            .insert(task, self.settings.max_pending_per_user)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                chain.release();
                return Err(e);
            }
        };

        self.enqueue(&stored);
        info!(
            task_id = %stored.id,
            user_id = %stored.user_id,
            due_at = %stored.due_at,
            "Task scheduled"
        );
        self.publish(DomainEvent::TaskScheduled {
            task_id: stored.id.0,
            user_id: stored.user_id.to_string(),
            due_at: stored.due_at,
            timestamp: Utc::now(),
        });
        Ok(stored)
    }

    /// Cancel a pending task owned by `requester`.
    pub async fn cancel(
        &self,
        id: TaskId,
        requester: &UserId,
    ) -> Result<ScheduledTask, ScheduleError> {
        let cancelled = self.store.cancel(id, requester).await?;
        self.lock_queue().remove(&(cancelled.due_at, cancelled.id));
        info!(task_id = %id, user_id = %requester, "Task cancelled");
        self.publish(DomainEvent::TaskCancelled {
            task_id: id.0,
            user_id: requester.to_string(),
            timestamp: Utc::now(),
        });
        Ok(cancelled)
    }

    pub async fn list_pending(&self, user_id: &UserId) -> Result<Vec<ScheduledTask>, ScheduleError> {
        self.store.list_pending(user_id).await
    }

    /// Load every pending task from the store into the queue.
    pub async fn reload(&self) -> Result<usize, ScheduleError> {
        let pending = self.store.all_pending().await?;
        let count = pending.len();
        let mut queue = self.lock_queue();
        queue.extend(pending.iter().map(|t| (t.due_at, t.id)));
        Ok(count)
    }

    /// Number of tasks the loop is waiting on.
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    /// Start the scheduling loop.
    ///
    /// Fired tasks are sent on `fire_tx`. The loop stops when `shutdown` is
    /// cancelled or the receiver is dropped.
    pub fn start(
        self: Arc<Self>,
        fire_tx: mpsc::Sender<FiredTask>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.reload_until_ok(&shutdown).await {
                return;
            }
            let mut last_purge: Option<tokio::time::Instant> = None;

            loop {
                if last_purge.is_none_or(|at| at.elapsed() >= self.settings.purge_interval) {
                    self.purge().await;
                    last_purge = Some(tokio::time::Instant::now());
                }

                let now = Utc::now();
                let wait = match self.next_due() {
                    Some((due_at, id)) if due_at <= now => {
                        match self.fire(id).await {
                            Ok(Some(fired)) => {
                                if fire_tx.send(fired).await.is_err() {
                                    debug!("Fired task receiver dropped, stopping scheduler loop");
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(task_id = %id, error = %e, "Failed to fire task, backing off");
                                if !self.backoff(&shutdown).await {
                                    return;
                                }
                            }
                        }
                        continue;
                    }
                    Some((due_at, _)) => (due_at - now).to_std().unwrap_or(Duration::ZERO),
                    None => self.settings.purge_interval,
                };
                let until_purge = last_purge
                    .map(|at| self.settings.purge_interval.saturating_sub(at.elapsed()))
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Task scheduler stopped");
                        return;
                    }
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(wait.min(until_purge)) => {}
                }
            }
        })
    }

    async fn reload_until_ok(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.reload().await {
                Ok(count) => {
                    info!(pending = count, "Task scheduler started");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load pending tasks, retrying");
                    if !self.backoff(shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep for the retry backoff. False if shutdown was requested meanwhile.
    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.settings.retry_backoff) => true,
        }
    }

    /// Transition one task to fired. `None` if it already left `pending`.
    async fn fire(&self, id: TaskId) -> Result<Option<FiredTask>, ScheduleError> {
        let fired = self.store.mark_fired(id).await?;
        let mut queue = self.lock_queue();
        queue.retain(|(_, queued)| *queued != id);
        drop(queue);

        let Some(task) = fired else {
            debug!(task_id = %id, "Task no longer pending, skipping");
            return Ok(None);
        };

        info!(
            task_id = %task.id,
            conversation_id = %task.conversation_id,
            "Task fired"
        );
        self.publish(DomainEvent::TaskFired {
            task_id: task.id.0,
            conversation_id: task.conversation_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(Some(FiredTask {
            task,
            fired_at: Utc::now(),
        }))
    }

    async fn purge(&self) {
        let before = Utc::now() - self.settings.retention;
        match self.store.purge_terminal(before).await {
            Ok(0) => {}
            Ok(n) => info!(purged = n, "Purged old tasks"),
            Err(e) => warn!(error = %e, "Failed to purge old tasks"),
        }
    }

    fn enqueue(&self, task: &ScheduledTask) {
        self.lock_queue().insert((task.due_at, task.id));
        self.wake.notify_one();
    }

    fn next_due(&self) -> Option<QueueKey> {
        self.lock_queue().first().copied()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, BTreeSet<QueueKey>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
