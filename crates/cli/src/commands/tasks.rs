//! `murmur tasks`: Inspect and cancel scheduled reminders.

use chrono::{Local, Utc};
use murmur_core::error::ScheduleError;
use murmur_core::message::{TaskId, UserId};
use murmur_scheduler::{ScheduledTask, humanize};

use super::{Stores, load_config};

pub async fn list(user: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let stores = Stores::open(&config).await?;
    let scheduler = stores.scheduler(&config, None);

    let pending = scheduler.list_pending(&UserId::from(user)).await?;
    if pending.is_empty() {
        println!("No pending reminders for {user}.");
        return Ok(());
    }

    println!("⏰ Pending reminders for {user}");
    println!("=============================");
    for task in &pending {
        println!("{}", render(task));
    }
    Ok(())
}

pub async fn cancel(id: i64, user: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let stores = Stores::open(&config).await?;
    let scheduler = stores.scheduler(&config, None);

    match scheduler.cancel(TaskId(id), &UserId::from(user)).await {
        Ok(task) => println!("🗑️  Cancelled #{}: {}", task.id, task.payload),
        Err(e @ (ScheduleError::NotFound(_) | ScheduleError::Forbidden { .. })) => println!("   {e}"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// One line per task: id, local due time, time left, payload.
pub fn render(task: &ScheduledTask) -> String {
    let left = (task.due_at - Utc::now()).num_minutes().max(0);
    format!(
        "  #{:<4} {}  (in {})  {}",
        task.id,
        task.due_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        humanize(left),
        task.payload
    )
}
