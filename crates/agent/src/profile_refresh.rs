//! Background fact extraction for user profiles.
//!
//! After a message is ingested, the engine asks [`ProfileRefresher::check`]
//! whether its author's profile is stale. Stale authors are queued together
//! with their recent messages; a single worker started by
//! [`ProfileRefresher::start`] sends each job to the model with an
//! extraction prompt and merges the answer through
//! [`MemoryStore::update_facts`], which also resets the message counter.
//!
//! Jobs run one at a time, so two refreshes of the same user never overlap.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_config::AppConfig;
use murmur_core::error::{ProviderError, Result};
use murmur_core::memory::{MemoryProfile, MemoryStore};
use murmur_core::message::{Author, Component, Message, Role, UserId};
use murmur_core::provider::{Provider, ProviderRequest};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ContextWindow;

const EXTRACTION_PROMPT: &str = "\
You maintain a short card of facts about one chat user for an assistant.

Rules:
1. Only write facts the user stated explicitly in the messages below.
2. Never infer or guess.
3. Keep each value short. Use lowercase snake_case keys such as name, city, job, languages, likes, dislikes.
4. If the messages hold nothing new, answer with no_change set to true.

Answer with JSON only: {\"facts\": {\"key\": \"value\"}, \"no_change\": false}

User: {user}
Current card:
{card}

Recent messages from this user:
{messages}";

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Newest window messages searched for the author's lines
    pub scan_depth: usize,
    /// Author messages sent to the model at most
    pub message_limit: usize,
    /// Pause after a failed job
    pub retry_backoff: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.1,
            max_tokens: 300,
            scan_depth: 100,
            message_limit: 15,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&AppConfig> for RefreshSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config
                .memory
                .refresh_model
                .clone()
                .unwrap_or_else(|| config.provider.model.clone()),
            retry_backoff: Duration::from_secs(config.scheduler.retry_backoff_secs),
            ..Self::default()
        }
    }
}

/// One queued extraction.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub user: Author,
    /// The user's own recent lines, oldest first
    pub messages: Vec<String>,
}

/// What the model answers.
#[derive(Debug, Default, Deserialize)]
struct Extraction {
    #[serde(default)]
    facts: BTreeMap<String, String>,
    #[serde(default)]
    no_change: bool,
}

pub struct ProfileRefresher {
    provider: Arc<dyn Provider>,
    memory: Arc<dyn MemoryStore>,
    settings: RefreshSettings,
    tx: mpsc::UnboundedSender<RefreshJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RefreshJob>>>,
    /// Users with a job waiting or running
    queued: Mutex<HashSet<UserId>>,
    /// Users without a profile who already had one extraction attempt
    attempted: Mutex<HashSet<UserId>>,
}

impl ProfileRefresher {
    pub fn new(provider: Arc<dyn Provider>, memory: Arc<dyn MemoryStore>, settings: RefreshSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            provider,
            memory,
            settings,
            tx,
            rx: Mutex::new(Some(rx)),
            queued: Mutex::new(HashSet::new()),
            attempted: Mutex::new(HashSet::new()),
        }
    }

    fn queued(&self) -> MutexGuard<'_, HashSet<UserId>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attempted(&self) -> MutexGuard<'_, HashSet<UserId>> {
        self.attempted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of users waiting for (or in) a refresh.
    pub fn pending(&self) -> usize {
        self.queued().len()
    }

    /// Queue `author` if their profile is due, against the current time.
    pub async fn check(&self, author: &Author, window: &ContextWindow) -> Result<bool> {
        self.check_at(author, window, Utc::now()).await
    }

    /// Queue `author` if their profile is due at `now`.
    ///
    /// A profile is due once [`MemoryProfile::should_refresh`] holds. A user
    /// with no stored profile gets a single attempt per process.
    pub async fn check_at(&self, author: &Author, window: &ContextWindow, now: DateTime<Utc>) -> Result<bool> {
        if self.queued().contains(&author.id) {
            return Ok(false);
        }
        let profile = self.memory.get_profile(&author.id).await?;
        let due = if profile.is_empty() {
            !self.attempted().contains(&author.id)
        } else {
            profile.should_refresh(now)
        };
        if !due {
            return Ok(false);
        }

        let messages = self.author_lines(&author.id, window);
        if messages.is_empty() {
            return Ok(false);
        }
        if profile.is_empty() {
            self.attempted().insert(author.id.clone());
        }
        if !self.queued().insert(author.id.clone()) {
            return Ok(false);
        }

        let job = RefreshJob {
            user: author.clone(),
            messages,
        };
        if self.tx.send(job).is_err() {
            self.queued().remove(&author.id);
            return Ok(false);
        }
        debug!(user_id = %author.id, "Profile refresh queued");
        Ok(true)
    }

    /// The author's newest lines in `window`, oldest first.
    fn author_lines(&self, user_id: &UserId, window: &ContextWindow) -> Vec<String> {
        let mut lines: Vec<String> = window
            .recent(self.settings.scan_depth)
            .iter()
            .filter(|m| m.role == Role::User)
            .filter(|m| m.author.as_ref().is_some_and(|a| &a.id == user_id))
            .map(Message::text)
            .collect();
        let skip = lines.len().saturating_sub(self.settings.message_limit);
        lines.drain(..skip);
        lines
    }

    /// Run one extraction and merge its facts.
    ///
    /// Returns the stored profile, or `None` when there was nothing to store
    /// for a user without a profile.
    pub async fn refresh(&self, job: RefreshJob) -> Result<Option<MemoryProfile>> {
        let current = self.memory.get_profile(&job.user.id).await?;
        let request = ProviderRequest {
            model: self.settings.model.clone(),
            messages: vec![Message::developer(vec![Component::text(extraction_prompt(
                &job, &current,
            ))])],
            temperature: self.settings.temperature,
            max_tokens: Some(self.settings.max_tokens),
            tools: Vec::new(),
        };
        let response = self.provider.complete(request).await?;
        let extraction = parse_extraction(&response.content).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "profile extraction is not a JSON object: {}",
                response.content.chars().take(120).collect::<String>()
            ))
        })?;

        let facts: BTreeMap<String, String> = if extraction.no_change {
            BTreeMap::new()
        } else {
            extraction
                .facts
                .into_iter()
                .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .collect()
        };

        if current.is_empty() && facts.is_empty() {
            debug!(user_id = %job.user.id, "Nothing to remember yet");
            return Ok(None);
        }

        // an empty merge still marks the profile as refreshed
        let profile = self.memory.update_facts(&job.user.id, facts).await?;
        info!(
            user_id = %job.user.id,
            facts = profile.facts.len(),
            "Profile refreshed"
        );
        Ok(Some(profile))
    }

    /// Start the refresh worker.
    ///
    /// It stops when `shutdown` is cancelled. Starting twice is a no-op for
    /// the second handle.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!("Profile refresher already started");
                return;
            };
            info!("Profile refresher started");

            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let user_id = job.user.id.clone();
                let result = self.refresh(job).await;
                self.queued().remove(&user_id);

                if let Err(e) = result {
                    warn!(user_id = %user_id, error = %e, "Profile refresh failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                    }
                }
            }
            info!("Profile refresher stopped");
        })
    }
}

fn extraction_prompt(job: &RefreshJob, current: &MemoryProfile) -> String {
    let card = if current.is_empty() {
        "(empty)".to_string()
    } else {
        current
            .facts
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let messages = job
        .messages
        .iter()
        .map(|m| format!("- {m}"))
        .collect::<Vec<_>>()
        .join("\n");

    EXTRACTION_PROMPT
        .replace("{user}", &format!("{} ({})", job.user.name, job.user.id))
        .replace("{card}", &card)
        .replace("{messages}", &messages)
}

/// The JSON object in a model answer, code fences and chatter tolerated.
fn parse_extraction(content: &str) -> Option<Extraction> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}
