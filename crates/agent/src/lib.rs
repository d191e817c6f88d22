//! The conversation engine of murmur.
//!
//! A message travels through the engine like this:
//!
//! 1. **Ingest**: the platform message is formatted and appended to its
//!    conversation's [`ContextWindow`]
//! 2. **Lock**: the conversation's [`Session`] lock serializes completions
//! 3. **Complete**: the [`CompletionOrchestrator`] calls the model and runs
//!    any requested tools until the model answers in text
//! 4. **Reply**: the answer goes back to the platform through a `Channel`
//!
//! Stale author profiles are queued after ingest and refreshed by a
//! background [`ProfileRefresher`].
//!
//! Fired reminders take the same path through [`ChatEngine`], in a scratch
//! window, so only their final answer lands in the conversation.

pub mod context;
pub mod ingest;
pub mod orchestrator;
pub mod pipeline;
pub mod profile_refresh;
pub mod session;
pub mod session_manager;

#[cfg(test)]
mod testing;

pub use context::{ContextWindow, PromptBuilder, WindowConfig, WindowStats};
pub use orchestrator::{CompletionOrchestrator, CycleOutcome, CycleRequest, OrchestratorSettings};
pub use pipeline::{ChatEngine, ChatMode, PipelineEvent};
pub use profile_refresh::{ProfileRefresher, RefreshSettings};
pub use session::{Session, SessionGuard};
pub use session_manager::SessionManager;
