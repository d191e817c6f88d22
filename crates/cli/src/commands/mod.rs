pub mod chat;
pub mod config_cmd;
pub mod memory;
pub mod tasks;

use std::sync::Arc;

use anyhow::Context;
use murmur_config::AppConfig;
use murmur_core::event::EventBus;
use murmur_core::memory::MemoryStore;
use murmur_memory::{InMemoryMemoryStore, SqliteMemoryStore};
use murmur_scheduler::{InMemoryTaskStore, SchedulerSettings, SqliteTaskStore, TaskScheduler, TaskStore};

/// Profile and task storage for one process.
pub struct Stores {
    pub memory: Arc<dyn MemoryStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl Stores {
    /// Open the configured backend. SQLite profiles and tasks share one
    /// database file and one pool.
    pub async fn open(config: &AppConfig) -> anyhow::Result<Self> {
        if config.memory.backend == "memory" {
            return Ok(Self {
                memory: Arc::new(InMemoryMemoryStore::new()),
                tasks: Arc::new(InMemoryTaskStore::new()),
            });
        }

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let url = format!("sqlite://{}", config.database_path().display());
        let pool = murmur_memory::open_pool(&url).await?;

        Ok(Self {
            memory: Arc::new(SqliteMemoryStore::from_pool(pool.clone()).await?),
            tasks: Arc::new(SqliteTaskStore::from_pool(pool).await?),
        })
    }

    pub fn scheduler(&self, config: &AppConfig, events: Option<Arc<EventBus>>) -> Arc<TaskScheduler> {
        let scheduler = TaskScheduler::new(self.tasks.clone(), SchedulerSettings::from(&config.scheduler));
        Arc::new(match events {
            Some(events) => scheduler.with_events(events),
            None => scheduler,
        })
    }
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    AppConfig::load().context("Failed to load config")
}
