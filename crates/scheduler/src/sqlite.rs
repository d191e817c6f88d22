//! SQLite task store.
//!
//! Status transitions are conditional `UPDATE ... WHERE status = 'pending'`
//! statements, so a task can leave `pending` exactly once even when several
//! scheduler loops (or a restarted one) race on it.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use murmur_core::error::ScheduleError;
use murmur_core::message::{ConversationId, MessageRef, TaskId, UserId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::store::{TaskStore, cancel_failure};
use crate::task::{NewTask, ScheduledTask, TaskStatus};

/// A SQLite-backed [`TaskStore`].
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: &str) -> Result<Self, ScheduleError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| ScheduleError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ScheduleError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite task store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (shared with the profile store, or tests).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, ScheduleError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), ScheduleError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id          TEXT NOT NULL,
                conversation_id  TEXT NOT NULL,
                origin_ref       TEXT,
                due_at           TEXT NOT NULL,
                payload          TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'pending',
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("scheduled_tasks table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_due ON scheduled_tasks(status, due_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("status/due index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_user_status ON scheduled_tasks(user_id, status)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("user/status index: {e}")))?;

        debug!("SQLite task migrations complete");
        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledTask, ScheduleError> {
        let col = |name: &str, e: sqlx::Error| ScheduleError::Storage(format!("{name} column: {e}"));

        let id: i64 = row.try_get("id").map_err(|e| col("id", e))?;
        let user_id: String = row.try_get("user_id").map_err(|e| col("user_id", e))?;
        let conversation_id: String = row
            .try_get("conversation_id")
            .map_err(|e| col("conversation_id", e))?;
        let origin: Option<String> = row.try_get("origin_ref").map_err(|e| col("origin_ref", e))?;
        let due_at: String = row.try_get("due_at").map_err(|e| col("due_at", e))?;
        let payload: String = row.try_get("payload").map_err(|e| col("payload", e))?;
        let status: String = row.try_get("status").map_err(|e| col("status", e))?;
        let created_at: String = row.try_get("created_at").map_err(|e| col("created_at", e))?;
        let updated_at: String = row.try_get("updated_at").map_err(|e| col("updated_at", e))?;

        Ok(ScheduledTask {
            id: TaskId(id),
            user_id: UserId(user_id),
            conversation_id: ConversationId(conversation_id),
            origin: origin.map(MessageRef),
            due_at: parse_timestamp(&due_at)?,
            payload,
            status: TaskStatus::from_str(&status).map_err(ScheduleError::Storage)?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }
}

/// Fixed-width UTC text, so SQL comparisons on timestamps order correctly.
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ScheduleError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ScheduleError::Storage(format!("bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: NewTask, max_pending: usize) -> Result<ScheduledTask, ScheduleError> {
        let now = format_timestamp(Utc::now());

        // The quota check and the insert are one statement.
        let row = sqlx::query(
            r#"
            INSERT INTO scheduled_tasks
                (user_id, conversation_id, origin_ref, due_at, payload, status, created_at, updated_at)
            SELECT ?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6
            WHERE (SELECT COUNT(*) FROM scheduled_tasks
                   WHERE user_id = ?1 AND status = 'pending') < ?7
            RETURNING *
            "#,
        )
        .bind(task.user_id.as_str())
        .bind(task.conversation_id.as_str())
        .bind(task.origin.as_ref().map(|m| m.as_str()))
        .bind(format_timestamp(task.due_at))
        .bind(&task.payload)
        .bind(&now)
        .bind(max_pending as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("INSERT task failed: {e}")))?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => {
                let pending = self.count_pending(&task.user_id).await?;
                Err(ScheduleError::QuotaExceeded {
                    user_id: task.user_id,
                    pending,
                    limit: max_pending,
                })
            }
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, ScheduleError> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ScheduleError::Storage(format!("SELECT task failed: {e}")))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn mark_fired(&self, id: TaskId) -> Result<Option<ScheduledTask>, ScheduleError> {
        let row = sqlx::query(
            r#"
            UPDATE scheduled_tasks SET status = 'fired', updated_at = ?2
            WHERE id = ?1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(format_timestamp(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("UPDATE fired failed: {e}")))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn cancel(&self, id: TaskId, requester: &UserId) -> Result<ScheduledTask, ScheduleError> {
        let row = sqlx::query(
            r#"
            UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?3
            WHERE id = ?1 AND user_id = ?2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(requester.as_str())
        .bind(format_timestamp(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("UPDATE cancelled failed: {e}")))?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => {
                let existing = self.get(id).await?;
                Err(cancel_failure(id, existing.as_ref(), requester))
            }
        }
    }

    async fn list_pending(&self, user_id: &UserId) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks WHERE user_id = ?1 AND status = 'pending' ORDER BY due_at, id",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("SELECT pending failed: {e}")))?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn all_pending(&self) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let rows =
            sqlx::query("SELECT * FROM scheduled_tasks WHERE status = 'pending' ORDER BY due_at, id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ScheduleError::Storage(format!("SELECT all pending failed: {e}")))?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_pending(&self, user_id: &UserId) -> Result<usize, ScheduleError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM scheduled_tasks WHERE user_id = ?1 AND status = 'pending'",
        )
        .bind(user_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("COUNT failed: {e}")))?;
        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| ScheduleError::Storage(format!("cnt column: {e}")))?;
        Ok(cnt as usize)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, ScheduleError> {
        let result = sqlx::query(
            "DELETE FROM scheduled_tasks WHERE status != 'pending' AND updated_at < ?1",
        )
        .bind(format_timestamp(before))
        .execute(&self.pool)
        .await
        .map_err(|e| ScheduleError::Storage(format!("DELETE terminal failed: {e}")))?;
        Ok(result.rows_affected())
    }
}
