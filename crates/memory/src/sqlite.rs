//! SQLite profile store.
//!
//! One row per user in `user_profiles`; facts are a JSON object in a TEXT
//! column. Fact merges run as a single `INSERT ... ON CONFLICT DO UPDATE`
//! using `json_patch`, so concurrent updates to the same user never lose keys
//! and updates to different users never contend on a shared lock.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_core::error::MemoryError;
use murmur_core::memory::{MemoryProfile, MemoryStore};
use murmur_core::message::UserId;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

/// A SQLite-backed [`MemoryStore`].
pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl SqliteMemoryStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// Accepts a file path or a `sqlite:` URL.
    pub async fn new(path: &str) -> Result<Self, MemoryError> {
        let pool = open_pool(path).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite memory store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (shared with the task store, or tests).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id                TEXT PRIMARY KEY NOT NULL,
                facts                  TEXT NOT NULL DEFAULT '{}',
                created_at             TEXT NOT NULL,
                updated_at             TEXT NOT NULL,
                messages_since_update  INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("user_profiles table: {e}")))?;

        debug!("SQLite profile migrations complete");
        Ok(())
    }

    fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryProfile, MemoryError> {
        let user_id: String = row
            .try_get("user_id")
            .map_err(|e| MemoryError::QueryFailed(format!("user_id column: {e}")))?;
        let facts_json: String = row
            .try_get("facts")
            .map_err(|e| MemoryError::QueryFailed(format!("facts column: {e}")))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| MemoryError::QueryFailed(format!("created_at column: {e}")))?;
        let updated_at: String = row
            .try_get("updated_at")
            .map_err(|e| MemoryError::QueryFailed(format!("updated_at column: {e}")))?;
        let counter: i64 = row
            .try_get("messages_since_update")
            .map_err(|e| MemoryError::QueryFailed(format!("messages_since_update column: {e}")))?;

        let facts: BTreeMap<String, String> = serde_json::from_str(&facts_json)
            .map_err(|e| MemoryError::QueryFailed(format!("facts for {user_id}: {e}")))?;

        Ok(MemoryProfile {
            user_id: UserId(user_id),
            facts,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            messages_since_update: u32::try_from(counter).unwrap_or(u32::MAX),
        })
    }
}

/// Build the pool the way every murmur SQLite store does.
pub async fn open_pool(path: &str) -> Result<SqlitePool, MemoryError> {
    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::QueryFailed(format!("bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_profile(&self, user_id: &UserId) -> Result<MemoryProfile, MemoryError> {
        let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = ?1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("SELECT profile: {e}")))?;

        match row {
            Some(row) => Self::row_to_profile(&row),
            None => Ok(MemoryProfile::empty(user_id.clone())),
        }
    }

    async fn update_facts(
        &self,
        user_id: &UserId,
        facts: BTreeMap<String, String>,
    ) -> Result<MemoryProfile, MemoryError> {
        let facts_json = serde_json::to_string(&facts)
            .map_err(|e| MemoryError::Storage(format!("Facts serialization: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let row = sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, facts, created_at, updated_at, messages_since_update)
            VALUES (?1, ?2, ?3, ?3, 0)
            ON CONFLICT(user_id) DO UPDATE SET
                facts = json_patch(user_profiles.facts, excluded.facts),
                updated_at = excluded.updated_at,
                messages_since_update = 0
            RETURNING *
            "#,
        )
        .bind(user_id.as_str())
        .bind(&facts_json)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("UPSERT profile failed: {e}")))?;

        debug!(user_id = %user_id, keys = facts.len(), "Merged profile facts");
        Self::row_to_profile(&row)
    }

    async fn reset(&self, user_id: &UserId) -> Result<bool, MemoryError> {
        let result = sqlx::query("DELETE FROM user_profiles WHERE user_id = ?1")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("DELETE profile failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_message(&self, user_id: &UserId) -> Result<(), MemoryError> {
        sqlx::query(
            "UPDATE user_profiles SET messages_since_update = messages_since_update + 1 WHERE user_id = ?1",
        )
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("UPDATE counter failed: {e}")))?;
        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<MemoryProfile>, MemoryError> {
        let rows = sqlx::query("SELECT * FROM user_profiles ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("SELECT profiles: {e}")))?;
        rows.iter().map(Self::row_to_profile).collect()
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM user_profiles")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("COUNT failed: {e}")))?;
        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| MemoryError::QueryFailed(format!("cnt column: {e}")))?;
        Ok(cnt as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> SqliteMemoryStore {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteMemoryStore::from_pool(pool).await.unwrap()
    }

    fn facts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn missing_profile_is_empty() {
        let store = test_store().await;
        let profile = store.get_profile(&UserId::from("ghost")).await.unwrap();
        assert!(profile.is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_merges_last_write_wins() {
        let store = test_store().await;
        let alice = UserId::from("alice");

        store
            .update_facts(&alice, facts(&[("city", "Paris"), ("pet", "cat")]))
            .await
            .unwrap();
        let merged = store
            .update_facts(&alice, facts(&[("city", "Lyon")]))
            .await
            .unwrap();

        assert_eq!(merged.facts["city"], "Lyon");
        assert_eq!(merged.facts["pet"], "cat");
        assert_eq!(store.get_profile(&alice).await.unwrap(), merged);
    }

    #[tokio::test]
    async fn reset_then_get_is_empty() {
        let store = test_store().await;
        let bob = UserId::from("bob");
        store.update_facts(&bob, facts(&[("job", "baker")])).await.unwrap();

        assert!(store.reset(&bob).await.unwrap());
        assert!(!store.reset(&bob).await.unwrap());
        assert!(store.get_profile(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_message_counts_until_update() {
        let store = test_store().await;
        let carol = UserId::from("carol");

        // No profile yet: nothing to count
        store.record_message(&carol).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        store.update_facts(&carol, facts(&[("a", "1")])).await.unwrap();
        for _ in 0..3 {
            store.record_message(&carol).await.unwrap();
        }
        assert_eq!(store.get_profile(&carol).await.unwrap().messages_since_update, 3);

        store.update_facts(&carol, facts(&[("b", "2")])).await.unwrap();
        assert_eq!(store.get_profile(&carol).await.unwrap().messages_since_update, 0);
    }

    #[tokio::test]
    async fn corrupt_timestamp_is_a_query_error() {
        let store = test_store().await;
        let frank = UserId::from("frank");
        store.update_facts(&frank, facts(&[("x", "1")])).await.unwrap();
        sqlx::query("UPDATE user_profiles SET updated_at = 'yesterday' WHERE user_id = ?1")
            .bind(frank.as_str())
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.get_profile(&frank).await.unwrap_err();
        assert!(matches!(err, MemoryError::QueryFailed(_)));
        assert!(store.list_profiles().await.is_err());
    }

    #[tokio::test]
    async fn concurrent_updates_keep_every_key() {
        let store = Arc::new(test_store().await);
        let dave = UserId::from("dave");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let dave = dave.clone();
                tokio::spawn(async move {
                    let key = format!("k{i}");
                    store
                        .update_facts(&dave, facts(&[(key.as_str(), "v")]))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.get_profile(&dave).await.unwrap().facts.len(), 8);
    }

    #[tokio::test]
    async fn profiles_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.db");
        let url = format!("sqlite://{}", path.display());
        let erin = UserId::from("erin");

        {
            let store = SqliteMemoryStore::new(&url).await.unwrap();
            store.update_facts(&erin, facts(&[("lang", "fr")])).await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteMemoryStore::new(&url).await.unwrap();
        assert_eq!(store.get_profile(&erin).await.unwrap().facts["lang"], "fr");
        assert_eq!(store.list_profiles().await.unwrap().len(), 1);
    }
}
