//! `murmur chat`: A terminal stand-in for a group chat.
//!
//! Every line typed is an inbound message in one conversation. Mentioning
//! `@<assistant name>` addresses the assistant; whether it answers follows
//! the chat mode. Lines starting with `/` are local commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use murmur_agent::{
    ChatEngine, ChatMode, CompletionOrchestrator, OrchestratorSettings, ProfileRefresher, PromptBuilder,
    RefreshSettings, SessionManager, WindowConfig,
};
use murmur_core::channel::{Channel, InboundMessage, OutboundReply};
use murmur_core::error::{ChannelError, ScheduleError};
use murmur_core::event::EventBus;
use murmur_core::message::{Author, ConversationId, TaskId, UserId};
use murmur_core::provider::Provider;
use murmur_scheduler::TaskScheduler;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Stores, load_config, memory, tasks};

/// Prints replies on stdout.
pub struct TerminalChannel {
    assistant_name: String,
}

impl TerminalChannel {
    pub fn new(assistant_name: impl Into<String>) -> Self {
        Self {
            assistant_name: assistant_name.into(),
        }
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn send(&self, reply: OutboundReply) -> Result<(), ChannelError> {
        println!();
        if let Some(origin) = &reply.reply_to {
            println!("  ↪ replying to {origin}");
        }
        for line in reply.content.lines() {
            println!("  {} > {line}", self.assistant_name);
        }
        if let Some(user) = &reply.mention {
            println!("  @{user}");
        }
        println!();
        Ok(())
    }
}

pub async fn run(conversation: String, user: String, name: String, verbose: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let provider: Arc<dyn Provider> = Arc::new(murmur_providers::build_from_config(&config).map_err(|e| {
        eprintln!();
        eprintln!("  ERROR: {e}");
        eprintln!("  Set MURMUR_API_KEY or OPENAI_API_KEY, or run `murmur config init`.");
        eprintln!();
        anyhow::anyhow!("no usable model provider")
    })?);

    let events = Arc::new(EventBus::default());
    let stores = Stores::open(&config).await?;
    let scheduler = stores.scheduler(&config, Some(events.clone()));
    let assistant_name = config.chat.assistant_name.clone();

    let tools = Arc::new(murmur_tools::default_registry(scheduler.clone(), stores.memory.clone()));
    let orchestrator = CompletionOrchestrator::new(
        provider.clone(),
        tools.clone(),
        PromptBuilder::new(config.context.developer_prompt.clone(), &assistant_name),
        OrchestratorSettings::from(&config),
    )
    .with_memory(stores.memory.clone())
    .with_events(events.clone());

    let sessions = Arc::new(
        SessionManager::new(WindowConfig::from(&config.context), config.context.system_prompt.clone())
            .context("Invalid context configuration")?
            .with_events(events.clone()),
    );
    let mode: ChatMode = config.chat.mode.parse().map_err(anyhow::Error::msg)?;

    let refresher = config.memory.auto_refresh.then(|| {
        Arc::new(ProfileRefresher::new(
            provider.clone(),
            stores.memory.clone(),
            RefreshSettings::from(&config),
        ))
    });

    let mut engine = ChatEngine::new(
        sessions.clone(),
        Arc::new(orchestrator),
        Arc::new(TerminalChannel::new(&assistant_name)),
        &assistant_name,
    )
    .with_memory(stores.memory.clone())
    .with_events(events.clone())
    .with_mode(mode)
    .with_lane_idle(Duration::from_secs(config.sessions.lane_idle_secs));
    if let Some(refresher) = &refresher {
        engine = engine.with_refresher(refresher.clone());
    }
    let engine = Arc::new(engine);
    let shutdown = engine.shutdown_token();

    // background services
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (fire_tx, fire_rx) = mpsc::channel(64);
    let scheduler_loop = scheduler.clone().start(fire_tx, shutdown.child_token());
    let eviction = sessions.clone().start_eviction(
        Duration::from_secs(config.sessions.max_idle_minutes * 60),
        Duration::from_secs(config.sessions.eviction_interval_secs),
        shutdown.child_token(),
    );
    let router = engine.clone().start(inbound_rx, fire_rx);
    let mut handles = vec![scheduler_loop, eviction, router];
    if let Some(refresher) = refresher {
        handles.push(refresher.start(shutdown.child_token()));
    }
    if verbose {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                debug!(?event, "Domain event");
            }
        });
    }

    let conversation_id = ConversationId::from(conversation.as_str());
    let author = Author::new(user.as_str(), name.as_str());

    println!();
    println!("  murmur: conversation '{conversation_id}' as {name} ({user})");
    println!("  Model:  {}", config.provider.model);
    println!("  Tools:  {}", tools.names().join(", "));
    println!("  Mode:   {mode}  (mention @{assistant_name} to address the assistant)");
    println!("  Type /help for commands, /quit to leave.");
    println!();

    let repl = Repl {
        engine: &engine,
        scheduler: &scheduler,
        stores: &stores,
        conversation_id: &conversation_id,
        author: &author,
        assistant_name: &assistant_name,
        next_ref: AtomicU64::new(1),
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            match repl.command(command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) => eprintln!("  [Error] {e}"),
            }
            continue;
        }
        if inbound_tx.send(repl.inbound(line)).await.is_err() {
            break;
        }
    }

    engine.shutdown();
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

struct Repl<'a> {
    engine: &'a Arc<ChatEngine>,
    scheduler: &'a Arc<TaskScheduler>,
    stores: &'a Stores,
    conversation_id: &'a ConversationId,
    author: &'a Author,
    assistant_name: &'a str,
    next_ref: AtomicU64,
}

impl Repl<'_> {
    fn inbound(&self, line: &str) -> InboundMessage {
        let n = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let mut message = InboundMessage::new(self.conversation_id.clone(), self.author.clone(), line)
            .with_ref(format!("m-{n}"));
        if is_mention(line, self.assistant_name) {
            message = message.addressed();
        }
        message
    }

    async fn command(&self, command: &str) -> anyhow::Result<Flow> {
        let mut parts = command.split_whitespace();
        let user_id: &UserId = &self.author.id;

        match (parts.next().unwrap_or(""), parts.next()) {
            ("quit" | "exit", _) => return Ok(Flow::Quit),
            ("help", _) => print_help(),
            ("mode", None) => println!("  Mode: {}", self.engine.mode()),
            ("mode", Some(mode)) => {
                let mode: ChatMode = mode.parse().map_err(anyhow::Error::msg)?;
                self.engine.set_mode(mode);
                println!("  Mode set to {mode}.");
            }
            ("stop", _) => {
                if self.engine.cancel(self.conversation_id) {
                    println!("  Stopped.");
                } else {
                    println!("  Nothing to stop.");
                }
            }
            ("forget", _) => {
                self.engine.forget(self.conversation_id).await;
                println!("  Conversation forgotten.");
            }
            ("memory", Some("reset")) => {
                self.stores.memory.reset(user_id).await?;
                println!("  Your profile was deleted.");
            }
            ("memory", _) => {
                let profile = self.stores.memory.get_profile(user_id).await?;
                print!("{}", memory::render(&profile));
            }
            ("tasks", _) => {
                let pending = self.scheduler.list_pending(user_id).await?;
                if pending.is_empty() {
                    println!("  No pending reminders.");
                }
                for task in &pending {
                    println!("{}", tasks::render(task));
                }
            }
            ("cancel", Some(id)) => {
                let id: i64 = id.trim_start_matches('#').parse().context("task id must be a number")?;
                match self.scheduler.cancel(TaskId(id), user_id).await {
                    Ok(task) => println!("  Cancelled #{}: {}", task.id, task.payload),
                    Err(e @ (ScheduleError::NotFound(_) | ScheduleError::Forbidden { .. })) => {
                        println!("  {e}")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            ("stats", _) => match self.engine.stats(self.conversation_id).await {
                Some(s) => println!(
                    "  {} messages ({} user, {} assistant, {} tool), {}/{} tokens ({:.1}%), {} active sessions",
                    s.messages,
                    s.user_messages,
                    s.assistant_messages,
                    s.tool_messages,
                    s.tokens,
                    s.budget,
                    s.usage_pct,
                    self.engine.sessions().len()
                ),
                None => println!("  Nothing said yet."),
            },
            (other, _) => println!("  Unknown command /{other}; try /help."),
        }
        Ok(Flow::Continue)
    }
}

/// `@name` anywhere in the line, case-insensitive.
fn is_mention(line: &str, assistant_name: &str) -> bool {
    let needle = format!("@{}", assistant_name.to_lowercase());
    line.to_lowercase()
        .split_whitespace()
        .any(|word| word.trim_end_matches(|c: char| !c.is_alphanumeric()) == needle)
}

fn print_help() {
    println!("  /mode [off|strict|greedy]  show or change when the assistant answers");
    println!("  /stop                      abort the answer being written");
    println!("  /forget                    clear this conversation's history");
    println!("  /memory [reset]            show or delete your profile");
    println!("  /tasks                     list your pending reminders");
    println!("  /cancel <id>               cancel one of your reminders");
    println!("  /stats                     context window usage");
    println!("  /quit                      leave");
}
