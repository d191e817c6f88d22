//! # murmur core
//!
//! Domain types, traits, and error definitions for the murmur chat assistant.
//! This crate has **no runtime dependencies** beyond tokio's sync primitives;
//! it defines the domain model every other crate implements against.
//!
//! ## Layout
//!
//! Every collaborator is defined as a trait here (`Provider`, `Tool`,
//! `MemoryStore`, `Channel`). Implementations live in their own crates, so
//! tests can swap in scripted or in-memory versions.

pub mod channel;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod provider;
pub mod token;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use channel::{Channel, InboundMessage, OutboundReply};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use memory::{MemoryProfile, MemoryStore};
pub use message::{
    Author, Component, ConversationId, Message, MessageRef, Role, TaskId, ToolCallRecord, UserId,
};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use tool::{ChainCounter, Tool, ToolContext, ToolRegistry, ToolResult};
