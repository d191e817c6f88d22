//! Memory store implementations for murmur.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteMemoryStore, open_pool};
