//! Error types for the murmur domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! also carries the cycle-level failures of the completion orchestrator.

use thiserror::Error;

use crate::message::{TaskId, UserId};

/// The top-level error type for all murmur operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Scheduling errors ---
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    // --- Context window errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Cycle errors ---
    #[error("Model call exceeded its {timeout_secs}s deadline")]
    ModelTimeout { timeout_secs: u64 },

    #[error("Tool-call loop exceeded {max_rounds} rounds")]
    ToolLoopExceeded { max_rounds: u32 },

    #[error("Completion cancelled by caller")]
    Cancelled,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// The model rejected an image URL it could not fetch.
    pub fn is_invalid_image(&self) -> bool {
        match self {
            Self::ApiError { message, .. } | Self::InvalidResponse(message) => {
                message.contains("invalid_image_url")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Message delivery failed to {conversation}: {reason}")]
    DeliveryFailed { conversation: String, reason: String },

    #[error("Channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// One orchestration cycle already created `cap` tasks.
    #[error("Schedule limit exceeded: at most {cap} tasks per response")]
    ChainLimitExceeded { cap: u32 },

    #[error("User {user_id} already has {pending} pending tasks (limit {limit})")]
    QuotaExceeded {
        user_id: UserId,
        pending: usize,
        limit: usize,
    },

    #[error("Task {0} not found or no longer pending")]
    NotFound(TaskId),

    #[error("Task {task_id} is not owned by {requester}")]
    Forbidden { task_id: TaskId, requester: UserId },

    #[error("Invalid delay: {0}")]
    InvalidDelay(String),

    #[error("Task storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(
        "Leading message costs {exempt_tokens} tokens, more than the {budget} token budget"
    )]
    ConfigInvariantViolation { exempt_tokens: usize, budget: usize },
}
