//! Delay validation and display.

use chrono::{DateTime, Duration, Utc};
use murmur_core::error::ScheduleError;

/// Accepted range for a reminder delay, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayBounds {
    pub min_minutes: i64,
    pub max_minutes: i64,
}

impl Default for DelayBounds {
    fn default() -> Self {
        // 2 minutes to 30 days
        Self {
            min_minutes: 2,
            max_minutes: 43_200,
        }
    }
}

impl DelayBounds {
    /// Combine minutes and hours into a checked delay.
    pub fn validate(&self, minutes: i64, hours: i64) -> Result<Duration, ScheduleError> {
        let total = hours
            .checked_mul(60)
            .and_then(|h| h.checked_add(minutes))
            .ok_or_else(|| ScheduleError::InvalidDelay("delay is too large".into()))?;

        if total < self.min_minutes {
            return Err(ScheduleError::InvalidDelay(format!(
                "delay must be at least {} minutes",
                self.min_minutes
            )));
        }
        if total > self.max_minutes {
            return Err(ScheduleError::InvalidDelay(format!(
                "delay must be at most {} minutes ({})",
                self.max_minutes,
                humanize(self.max_minutes)
            )));
        }
        Ok(Duration::minutes(total))
    }

    pub fn due_at(
        &self,
        now: DateTime<Utc>,
        minutes: i64,
        hours: i64,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        Ok(now + self.validate(minutes, hours)?)
    }
}

/// Render a number of minutes as `1 d 2 h 5 min`, omitting zero parts.
pub fn humanize(total_minutes: i64) -> String {
    let days = total_minutes / 1440;
    let hours = (total_minutes % 1440) / 60;
    let minutes = total_minutes % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days} d"));
    }
    if hours > 0 {
        parts.push(format!("{hours} h"));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{minutes} min"));
    }
    parts.join(" ")
}
