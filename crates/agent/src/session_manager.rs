//! Session table keyed by conversation.
//!
//! One lock per conversation: the table itself is only locked for lookups
//! and eviction sweeps, never across an await, so conversations proceed
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_core::error::ContextError;
use murmur_core::event::{DomainEvent, EventBus};
use murmur_core::message::{ConversationId, Message};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::{ContextWindow, WindowConfig};
use crate::session::Session;

pub struct SessionManager {
    sessions: Mutex<HashMap<ConversationId, Arc<Session>>>,
    window_config: WindowConfig,
    /// Exempt leading message of every new window.
    system_prompt: Option<String>,
    events: Option<Arc<EventBus>>,
}

impl SessionManager {
    /// Fails when `system_prompt` alone is over the token budget.
    pub fn new(window_config: WindowConfig, system_prompt: Option<String>) -> Result<Self, ContextError> {
        let manager = Self {
            sessions: Mutex::new(HashMap::new()),
            window_config,
            system_prompt,
            events: None,
        };
        manager.new_window()?;
        Ok(manager)
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn window_config(&self) -> &WindowConfig {
        &self.window_config
    }

    /// A fresh window with the configured leading message.
    pub fn new_window(&self) -> Result<ContextWindow, ContextError> {
        match &self.system_prompt {
            Some(prompt) => ContextWindow::with_leading(self.window_config, Message::system(prompt)),
            None => Ok(ContextWindow::new(self.window_config)),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ConversationId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The conversation's session, created on first use.
    pub fn get_or_create(&self, conversation_id: &ConversationId) -> Result<Arc<Session>, ContextError> {
        let mut table = self.table();
        if let Some(existing) = table.get(conversation_id) {
            return Ok(existing.clone());
        }
        let session = Arc::new(Session::new(conversation_id.clone(), self.new_window()?));
        table.insert(conversation_id.clone(), session.clone());
        debug!(conversation_id = %conversation_id, "Session created");
        Ok(session)
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<Arc<Session>> {
        self.table().get(conversation_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Evict sessions idle for longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(Utc::now(), max_idle)
    }

    /// Eviction as seen at `now`.
    ///
    /// A session is only removed when nobody holds or waits for its lock and
    /// no caller still has a handle to it.
    pub fn evict_idle_at(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let mut table = self.table();
        let before = table.len();

        table.retain(|id, session| {
            let idle = now.signed_duration_since(session.last_activity()) > max_idle;
            if !idle || Arc::strong_count(session) > 1 {
                return true;
            }
            let unused = session.try_idle_lock().is_some();
            if unused {
                debug!(conversation_id = %id, "Session evicted");
            }
            !unused
        });

        let evicted = before - table.len();
        drop(table);

        if evicted > 0 {
            info!(evicted, "Idle sessions evicted");
            if let Some(events) = &self.events {
                events.publish(DomainEvent::SessionsEvicted {
                    count: evicted,
                    timestamp: Utc::now(),
                });
            }
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until `shutdown`
    /// is cancelled.
    pub fn start_eviction(
        self: Arc<Self>,
        max_idle: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session eviction stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.evict_idle(max_idle);
                    }
                }
            }
        })
    }
}
