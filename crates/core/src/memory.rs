//! Memory trait: long-term facts about individual users.
//!
//! A [`MemoryProfile`] outlives every conversation and every process
//! restart. It is only changed through explicit operations; nothing in the
//! completion path overwrites it implicitly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::{Component, UserId};

/// Messages a user must send before their profile is worth refreshing.
pub const REFRESH_MESSAGE_THRESHOLD: u32 = 30;

/// Minimum time between two refreshes of the same profile.
pub const REFRESH_MIN_INTERVAL_HOURS: i64 = 12;

/// Facts known about one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub user_id: UserId,

    /// Fact key to fact value, e.g. "city" -> "Lyon"
    #[serde(default)]
    pub facts: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Messages recorded since the last fact update
    #[serde(default)]
    pub messages_since_update: u32,
}

impl MemoryProfile {
    /// The profile returned for users nobody has recorded anything about.
    pub fn empty(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            facts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            messages_since_update: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Whether enough activity happened to justify a new fact extraction.
    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        self.messages_since_update >= REFRESH_MESSAGE_THRESHOLD
            && now - self.updated_at >= Duration::hours(REFRESH_MIN_INTERVAL_HOURS)
    }

    /// The profile as a metadata component for a developer prompt.
    pub fn to_component(&self, display_name: &str) -> Component {
        let mut fields = vec![
            ("user".to_string(), display_name.to_string()),
            ("id".to_string(), self.user_id.to_string()),
        ];
        fields.extend(self.facts.iter().map(|(k, v)| (k.clone(), v.clone())));
        Component::Metadata {
            title: "PROFILE".into(),
            fields,
        }
    }
}

/// The core MemoryStore trait.
///
/// Each operation is atomic per user; no operation needs a lock spanning
/// several users. Implementations: SQLite, in-memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// The user's profile, or an empty one if none exists.
    async fn get_profile(&self, user_id: &UserId) -> std::result::Result<MemoryProfile, MemoryError>;

    /// Merge facts into the profile (last write wins per key), creating it if
    /// needed. Returns the profile after the merge.
    async fn update_facts(
        &self,
        user_id: &UserId,
        facts: BTreeMap<String, String>,
    ) -> std::result::Result<MemoryProfile, MemoryError>;

    /// Delete the profile. Returns whether one existed.
    async fn reset(&self, user_id: &UserId) -> std::result::Result<bool, MemoryError>;

    /// Count one message from a user with an existing profile.
    async fn record_message(&self, user_id: &UserId) -> std::result::Result<(), MemoryError>;

    /// Every stored profile, ordered by user id.
    async fn list_profiles(&self) -> std::result::Result<Vec<MemoryProfile>, MemoryError>;

    /// Number of stored profiles.
    async fn count(&self) -> std::result::Result<usize, MemoryError>;
}
