//! One conversation's window behind its own lock.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use murmur_core::message::ConversationId;
use tokio::sync::{Mutex, MutexGuard};

use crate::context::ContextWindow;

/// A conversation's [`ContextWindow`] plus the lock that serializes work on
/// it. Lock waiters are served in arrival order.
pub struct Session {
    conversation_id: ConversationId,
    window: Mutex<ContextWindow>,
    created_at: DateTime<Utc>,
    /// Milliseconds since the epoch.
    last_activity: AtomicI64,
}

impl Session {
    pub fn new(conversation_id: ConversationId, window: ContextWindow) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            window: Mutex::new(window),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Acquire))
            .unwrap_or(self.created_at)
    }

    pub fn touch(&self) {
        self.last_activity
            .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    /// Wait for exclusive access to the window.
    ///
    /// Activity is recorded when the lock is taken and again when the guard
    /// is dropped.
    pub async fn lock(&self) -> SessionGuard<'_> {
        let window = self.window.lock().await;
        self.touch();
        SessionGuard {
            session: self,
            window,
        }
    }

    /// Run `f` with exclusive access to the window. The lock is released on
    /// every exit path, including a panic unwinding through `f`.
    pub async fn with_lock<R>(&self, f: impl AsyncFnOnce(&mut ContextWindow) -> R) -> R {
        let mut guard = self.lock().await;
        f(&mut *guard).await
    }

    /// Whether a holder currently has the window.
    pub fn is_busy(&self) -> bool {
        self.window.try_lock().is_err()
    }

    /// Exclusive access only if nobody holds the lock; does not count as
    /// activity.
    pub(crate) fn try_idle_lock(&self) -> Option<MutexGuard<'_, ContextWindow>> {
        self.window.try_lock().ok()
    }
}

/// Exclusive access to a session's window.
pub struct SessionGuard<'a> {
    session: &'a Session,
    window: MutexGuard<'a, ContextWindow>,
}

impl Deref for SessionGuard<'_> {
    type Target = ContextWindow;

    fn deref(&self) -> &ContextWindow {
        &self.window
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut ContextWindow {
        &mut self.window
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.touch();
    }
}
