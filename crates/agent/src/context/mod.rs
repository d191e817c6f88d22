//! Per-conversation message history and the per-cycle developer prompt.
//!
//! | Piece | Stored in the window | Trimmed |
//! |-------|----------------------|---------|
//! | System prompt | Yes, as the leading message | Never |
//! | Developer prompt | No, rebuilt every cycle | n/a |
//! | User, tool and assistant messages | Yes | Oldest first, by budget and age |

pub mod prompt;
pub mod window;

pub use prompt::PromptBuilder;
pub use window::{ContextWindow, WindowConfig, WindowStats};
