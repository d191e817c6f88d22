//! Message domain types and identifiers.
//!
//! A [`Message`] is an ordered list of [`Component`]s plus its author and
//! creation time. Its token cost is computed once at construction and never
//! changes afterwards: messages are immutable once they enter a context window.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::{IMAGE_TOKENS, MESSAGE_OVERHEAD_TOKENS, estimate_tokens};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identity of a chat-platform user.
    UserId
);
string_id!(
    /// A chat channel or thread treated as one continuous context.
    ConversationId
);
string_id!(
    /// Platform reference to a single message, used to address replies.
    MessageRef
);

/// Identifier of a persisted scheduled task. Allocated by the task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Standing instructions, exempt from trimming when leading a window
    System,
    /// Per-cycle instructions (date, user profile)
    Developer,
    /// A chat participant
    User,
    /// The assistant
    Assistant,
    /// Tool execution result
    Tool,
}

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
}

impl Author {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId(id.into()),
            name: name.into(),
        }
    }
}

/// Requested resolution for an image component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
    #[default]
    Auto,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Component {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default)]
        detail: ImageDetail,
    },
    /// Structured data rendered to the model as a text tag.
    Metadata {
        title: String,
        fields: Vec<(String, String)>,
    },
}

pub const REFERENCE_TITLE: &str = "REFERENCE";

impl Component {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::Image {
            url: url.into(),
            detail: ImageDetail::Auto,
        }
    }

    pub fn metadata<K, V>(title: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::Metadata {
            title: title.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// A quote of one of the assistant's own earlier messages.
    pub fn reference_to_self(preview: impl Into<String>) -> Self {
        Self::metadata(
            REFERENCE_TITLE,
            [("yourself", "true".to_string()), ("starting_with", preview.into())],
        )
    }

    /// A quote of another participant's message.
    pub fn reference_to(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::metadata(
            REFERENCE_TITLE,
            [("author", author.into()), ("content", content.into())],
        )
    }

    /// Text the model sees for this component. Images have none.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Text { text } => Some(text.clone()),
            Self::Image { .. } => None,
            Self::Metadata { title, fields } => Some(render_metadata(title, fields)),
        }
    }

    pub fn token_cost(&self) -> usize {
        match self {
            Self::Image { .. } => IMAGE_TOKENS,
            other => other.render().map(|t| estimate_tokens(&t)).unwrap_or(0),
        }
    }
}

fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn render_metadata(title: &str, fields: &[(String, String)]) -> String {
    if title.eq_ignore_ascii_case(REFERENCE_TITLE) {
        if field(fields, "yourself") == Some("true") {
            let preview = field(fields, "starting_with").unwrap_or_default();
            return format!("[REFERENCE to your previous message: {preview}]");
        }
        let author = field(fields, "author").unwrap_or("user");
        let content = field(fields, "content").unwrap_or_default();
        return format!("[REFERENCE to message from {author}: {content}]");
    }

    let mut out = format!("<{}", title.to_uppercase());
    for (k, v) in fields {
        out.push(' ');
        out.push_str(&k.to_lowercase());
        out.push('=');
        out.push_str(v);
    }
    out.push('>');
    out
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Call ID assigned by the model
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    components: Vec<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,

    pub created_at: DateTime<Utc>,

    token_cost: usize,

    /// For tool-role messages: the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,

    /// Optional metadata (task id, platform message ref, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, components: Vec<Component>) -> Self {
        let token_cost =
            MESSAGE_OVERHEAD_TOKENS + components.iter().map(Component::token_cost).sum::<usize>();
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            components,
            author: None,
            created_at: Utc::now(),
            token_cost,
            tool_call: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Component::text(content)])
    }

    pub fn developer(components: Vec<Component>) -> Self {
        Self::new(Role::Developer, components)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Component::text(content)])
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Component::text(content)])
    }

    /// A tool-role message answering `call` with a JSON payload.
    pub fn tool_response(call: ToolCallRecord, payload: &serde_json::Value) -> Self {
        let mut msg = Self::new(Role::Tool, vec![Component::text(payload.to_string())]);
        msg.tool_call = Some(call);
        msg
    }

    pub fn with_author(mut self, author: Author) -> Self {
        self.author = Some(author);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Estimated token cost, fixed at construction.
    pub fn token_cost(&self) -> usize {
        self.token_cost
    }

    /// Concatenated text of all text and metadata components.
    pub fn text(&self) -> String {
        self.components
            .iter()
            .filter_map(Component::render)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_image(&self) -> bool {
        self.components
            .iter()
            .any(|c| matches!(c, Component::Image { .. }))
    }

    /// A copy with every image component removed and the cost recomputed.
    /// Identity, author, timestamps and metadata are kept.
    pub fn without_images(&self) -> Self {
        let components: Vec<Component> = self
            .components
            .iter()
            .filter(|c| !matches!(c, Component::Image { .. }))
            .cloned()
            .collect();
        Self {
            token_cost: MESSAGE_OVERHEAD_TOKENS
                + components.iter().map(Component::token_cost).sum::<usize>(),
            components,
            ..self.clone()
        }
    }

    /// The call id when this is a tool response.
    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_call.as_ref().map(|c| c.id.as_str())
    }
}
