//! In-memory profile store: useful for testing and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use murmur_core::error::MemoryError;
use murmur_core::memory::{MemoryProfile, MemoryStore};
use murmur_core::message::UserId;
use tokio::sync::RwLock;

/// Profiles kept in a map. Each operation holds the write lock only for the
/// duration of one map update.
pub struct InMemoryMemoryStore {
    profiles: Arc<RwLock<HashMap<UserId, MemoryProfile>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_profile(&self, user_id: &UserId) -> Result<MemoryProfile, MemoryError> {
        Ok(self
            .profiles
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| MemoryProfile::empty(user_id.clone())))
    }

    async fn update_facts(
        &self,
        user_id: &UserId,
        facts: BTreeMap<String, String>,
    ) -> Result<MemoryProfile, MemoryError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .entry(user_id.clone())
            .or_insert_with(|| MemoryProfile::empty(user_id.clone()));
        profile.facts.extend(facts);
        profile.updated_at = Utc::now();
        profile.messages_since_update = 0;
        Ok(profile.clone())
    }

    async fn reset(&self, user_id: &UserId) -> Result<bool, MemoryError> {
        Ok(self.profiles.write().await.remove(user_id).is_some())
    }

    async fn record_message(&self, user_id: &UserId) -> Result<(), MemoryError> {
        if let Some(profile) = self.profiles.write().await.get_mut(user_id) {
            profile.messages_since_update = profile.messages_since_update.saturating_add(1);
        }
        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<MemoryProfile>, MemoryError> {
        let mut all: Vec<_> = self.profiles.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(all)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.profiles.read().await.len())
    }
}
