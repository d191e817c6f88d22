//! Domain event system: decoupled observation of what the assistant does.
//!
//! Events are published when something interesting happens in the system.
//! Subscribers (the CLI's verbose log, tests) react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A chat message entered a conversation's context window
    MessageIngested {
        conversation_id: String,
        author_id: String,
        content_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// A completion cycle produced its final reply
    CompletionFinished {
        conversation_id: String,
        model: String,
        rounds: u32,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        conversation_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A reminder task was persisted
    TaskScheduled {
        task_id: i64,
        user_id: String,
        due_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A reminder task transitioned to fired
    TaskFired {
        task_id: i64,
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A reminder task was cancelled by its owner
    TaskCancelled {
        task_id: i64,
        user_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Idle sessions were dropped
    SessionsEvicted {
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            conversation_id: "c1".into(),
            tool_name: "calculator".into(),
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted {
                tool_name, success, ..
            } => {
                assert_eq!(tool_name, "calculator");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
