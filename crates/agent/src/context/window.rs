//! Budgeted message history for one conversation.
//!
//! The window keeps an optional leading message (standing instructions)
//! that is exempt from trimming, followed by the conversation in append
//! order. After [`ContextWindow::trim`] the total estimated cost fits the
//! token budget and no non-exempt message is older than the age cutoff.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use murmur_core::error::ContextError;
use murmur_core::message::{Message, Role};
use serde::Serialize;
use tracing::debug;

/// Limits enforced by [`ContextWindow::trim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Maximum estimated tokens, leading message included.
    pub token_budget: usize,
    /// Messages created before `now - max_age` are dropped; `None` keeps them.
    pub max_age: Option<Duration>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            token_budget: 24_576,
            max_age: Some(Duration::minutes(120)),
        }
    }
}

impl From<&murmur_config::ContextConfig> for WindowConfig {
    fn from(config: &murmur_config::ContextConfig) -> Self {
        Self {
            token_budget: config.token_budget,
            max_age: i64::try_from(config.max_age_minutes)
                .ok()
                .filter(|minutes| *minutes > 0)
                .and_then(Duration::try_minutes),
        }
    }
}

/// Counters for the `/stats` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub messages: usize,
    pub tokens: usize,
    pub budget: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_messages: usize,
    /// Share of the budget in use, 0.0 to 100.0.
    pub usage_pct: f32,
    pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ContextWindow {
    config: WindowConfig,
    leading: Option<Message>,
    messages: VecDeque<Message>,
    /// Cost of `messages`; the leading message is counted separately.
    tokens: usize,
}

impl ContextWindow {
    /// A window without a leading message.
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            leading: None,
            messages: VecDeque::new(),
            tokens: 0,
        }
    }

    /// A window headed by an exempt message.
    ///
    /// Fails when that message alone does not fit the budget.
    pub fn with_leading(config: WindowConfig, leading: Message) -> Result<Self, ContextError> {
        check_leading(&config, &leading)?;
        Ok(Self {
            leading: Some(leading),
            ..Self::new(config)
        })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn leading(&self) -> Option<&Message> {
        self.leading.as_ref()
    }

    /// Add a message at the newest end. Does not trim.
    pub fn append(&mut self, message: Message) {
        self.tokens += message.token_cost();
        self.messages.push_back(message);
    }

    /// Remove the `count` newest messages, returning them oldest first.
    pub(crate) fn pop_newest(&mut self, count: usize) -> Vec<Message> {
        let keep = self.messages.len().saturating_sub(count);
        let removed: Vec<Message> = self.messages.drain(keep..).collect();
        self.tokens -= removed.iter().map(Message::token_cost).sum::<usize>();
        removed
    }

    /// Trim against the current time.
    pub fn trim(&mut self) -> Result<usize, ContextError> {
        self.trim_at(Utc::now())
    }

    /// Drop the oldest non-exempt messages until the age cutoff and the
    /// token budget both hold at `now`. Returns how many were dropped.
    pub fn trim_at(&mut self, now: DateTime<Utc>) -> Result<usize, ContextError> {
        let leading_tokens = match &self.leading {
            Some(leading) => check_leading(&self.config, leading)?,
            None => 0,
        };
        let before = self.messages.len();

        if let Some(cutoff) = self.config.max_age.and_then(|age| now.checked_sub_signed(age)) {
            let expired_tokens: usize = self
                .messages
                .iter()
                .filter(|m| m.created_at < cutoff)
                .map(Message::token_cost)
                .sum();
            self.messages.retain(|m| m.created_at >= cutoff);
            self.tokens -= expired_tokens;
        }

        let allowance = self.config.token_budget - leading_tokens;
        while self.tokens > allowance {
            match self.messages.pop_front() {
                Some(oldest) => self.tokens -= oldest.token_cost(),
                None => break,
            }
        }

        let dropped = before - self.messages.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.messages.len(), tokens = self.total_tokens(), "Window trimmed");
        }
        Ok(dropped)
    }

    /// Every message, leading one first, oldest to newest.
    pub fn snapshot(&self) -> Vec<Message> {
        self.leading
            .iter()
            .chain(self.messages.iter())
            .cloned()
            .collect()
    }

    /// The `n` newest non-exempt messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Replace every message carrying images with an image-free copy.
    /// Returns how many messages changed.
    pub fn strip_images(&mut self) -> usize {
        let mut stripped = 0;
        for message in self.messages.iter_mut().filter(|m| m.has_image()) {
            let replacement = message.without_images();
            self.tokens = self.tokens - message.token_cost() + replacement.token_cost();
            *message = replacement;
            stripped += 1;
        }
        if stripped > 0 {
            debug!(stripped, tokens = self.tokens, "Images removed from window");
        }
        stripped
    }

    /// Forget the conversation, keeping the leading message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.tokens = 0;
    }

    /// Number of non-exempt messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Running token total, leading message included.
    pub fn total_tokens(&self) -> usize {
        self.tokens + self.leading.as_ref().map_or(0, Message::token_cost)
    }

    pub fn stats(&self) -> WindowStats {
        let count = |role: Role| self.messages.iter().filter(|m| m.role == role).count();
        let tokens = self.total_tokens();
        WindowStats {
            messages: self.messages.len(),
            tokens,
            budget: self.config.token_budget,
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            tool_messages: count(Role::Tool),
            usage_pct: if self.config.token_budget == 0 {
                0.0
            } else {
                (tokens as f32 / self.config.token_budget as f32) * 100.0
            },
            oldest: self.messages.front().map(|m| m.created_at),
        }
    }
}

fn check_leading(config: &WindowConfig, leading: &Message) -> Result<usize, ContextError> {
    let cost = leading.token_cost();
    if cost > config.token_budget {
        return Err(ContextError::ConfigInvariantViolation {
            exempt_tokens: cost,
            budget: config.token_budget,
        });
    }
    Ok(cost)
}
