//! Channel trait: the boundary with the chat platform.
//!
//! The platform hands the assistant [`InboundMessage`]s and receives
//! [`OutboundReply`]s. Delivery, rendering and command registration are the
//! platform's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::message::{Author, ConversationId, MessageRef, UserId};

/// Platform message size limit.
pub const MAX_REPLY_CHARS: usize = 2000;

/// Size of each chunk when a reply exceeds [`MAX_REPLY_CHARS`].
pub const REPLY_CHUNK_CHARS: usize = 1900;

/// A message quoted or replied to by an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedMessage {
    /// True when the quoted message was written by the assistant
    pub from_assistant: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,

    pub content: String,
}

/// "New message in conversation X from user Y with content Z".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: ConversationId,

    /// Platform reference, used to address replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ref: Option<MessageRef>,

    pub author: Author,

    pub content: String,

    /// URLs of attached images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted: Option<QuotedMessage>,

    /// The platform says the assistant was mentioned or replied to
    #[serde(default)]
    pub addressed: bool,
}

impl InboundMessage {
    pub fn new(conversation_id: ConversationId, author: Author, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            message_ref: None,
            author,
            content: content.into(),
            image_urls: Vec::new(),
            quoted: None,
            addressed: false,
        }
    }

    pub fn with_ref(mut self, message_ref: impl Into<String>) -> Self {
        self.message_ref = Some(MessageRef(message_ref.into()));
        self
    }

    pub fn addressed(mut self) -> Self {
        self.addressed = true;
        self
    }
}

/// "Send reply R to conversation X, optionally as a reply to message M".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub conversation_id: ConversationId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageRef>,

    /// User to mention when there is no message to reply to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention: Option<UserId>,

    pub content: String,
}

impl OutboundReply {
    /// The content split into platform-sized pieces, on char boundaries.
    pub fn chunks(&self) -> Vec<String> {
        if self.content.chars().count() <= MAX_REPLY_CHARS {
            return vec![self.content.clone()];
        }
        let chars: Vec<char> = self.content.chars().collect();
        chars
            .chunks(REPLY_CHUNK_CHARS)
            .map(|c| c.iter().collect())
            .collect()
    }
}

/// The core Channel trait.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name (e.g., "cli", "discord").
    fn name(&self) -> &str;

    /// Deliver a reply to the platform.
    async fn send(&self, reply: OutboundReply) -> std::result::Result<(), ChannelError>;
}
