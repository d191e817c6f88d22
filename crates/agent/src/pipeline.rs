//! The calling layer: routes inbound messages and fired reminders through
//! per-conversation lanes into sessions and the orchestrator.
//!
//! Each conversation gets one worker ("lane") fed by an unbounded queue, so
//! events for a conversation are handled in arrival order while different
//! conversations run concurrently. A lane exits after sitting idle and is
//! recreated on the next event.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use murmur_core::channel::{Channel, InboundMessage, OutboundReply};
use murmur_core::error::{Error, Result};
use murmur_core::event::{DomainEvent, EventBus};
use murmur_core::memory::MemoryStore;
use murmur_core::message::{Author, ConversationId, Message};
use murmur_scheduler::FiredTask;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::WindowStats;
use crate::ingest;
use crate::orchestrator::{CompletionOrchestrator, CycleOutcome, CycleRequest};
use crate::profile_refresh::ProfileRefresher;
use crate::session_manager::SessionManager;

/// Sent when a cycle fails for a message that expected an answer.
pub const FAILURE_REPLY: &str = "Something went wrong while answering your message.";

/// When the assistant answers on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatMode {
    /// Listen only
    Off,
    /// Answer when addressed
    #[default]
    Strict,
    /// Answer when addressed or named
    Greedy,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Off => "off",
            ChatMode::Strict => "strict",
            ChatMode::Greedy => "greedy",
        }
    }

    /// Whether `message` calls for a completion under this mode.
    pub fn should_respond(&self, message: &InboundMessage, assistant_name: &str) -> bool {
        match self {
            ChatMode::Off => false,
            ChatMode::Strict => message.addressed,
            ChatMode::Greedy => message.addressed || names_word(&message.content, assistant_name),
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ChatMode::Off),
            "strict" => Ok(ChatMode::Strict),
            "greedy" => Ok(ChatMode::Greedy),
            other => Err(format!("unknown chat mode '{other}' (expected off, strict or greedy)")),
        }
    }
}

/// Case-insensitive whole-word match.
fn names_word(text: &str, name: &str) -> bool {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return false;
    }
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|word| word == name)
}

/// Work for a conversation lane.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Inbound(InboundMessage),
    Fired(FiredTask),
}

impl PipelineEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            PipelineEvent::Inbound(m) => &m.conversation_id,
            PipelineEvent::Fired(f) => &f.task.conversation_id,
        }
    }
}

struct Lane {
    generation: u64,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

/// Ties sessions, the orchestrator and the platform channel together.
pub struct ChatEngine {
    sessions: Arc<SessionManager>,
    orchestrator: Arc<CompletionOrchestrator>,
    channel: Arc<dyn Channel>,
    memory: Option<Arc<dyn MemoryStore>>,
    refresher: Option<Arc<ProfileRefresher>>,
    events: Option<Arc<EventBus>>,
    mode: Mutex<ChatMode>,
    assistant_name: String,
    lanes: Mutex<HashMap<ConversationId, Lane>>,
    /// Parent token of every cycle in a conversation, child of `shutdown`
    cycle_tokens: Mutex<HashMap<ConversationId, CancellationToken>>,
    next_generation: AtomicU64,
    lane_idle: Duration,
    shutdown: CancellationToken,
}

impl ChatEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        orchestrator: Arc<CompletionOrchestrator>,
        channel: Arc<dyn Channel>,
        assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            orchestrator,
            channel,
            memory: None,
            refresher: None,
            events: None,
            mode: Mutex::new(ChatMode::default()),
            assistant_name: assistant_name.into(),
            lanes: Mutex::new(HashMap::new()),
            cycle_tokens: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            lane_idle: Duration::from_secs(600),
            shutdown: CancellationToken::new(),
        }
    }

    /// Count ingested messages against author profiles.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Queue stale author profiles for fact extraction after ingest.
    pub fn with_refresher(mut self, refresher: Arc<ProfileRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_mode(self, mode: ChatMode) -> Self {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        self
    }

    pub fn with_lane_idle(mut self, lane_idle: Duration) -> Self {
        self.lane_idle = lane_idle;
        self
    }

    pub fn mode(&self) -> ChatMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: ChatMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        info!(mode = %mode, "Chat mode changed");
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn orchestrator(&self) -> &Arc<CompletionOrchestrator> {
        &self.orchestrator
    }

    /// Token that stops the router and every lane.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Ingest an inbound message and, if the mode calls for it, answer it.
    ///
    /// Ingestion and the completion share one hold of the session lock.
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<Option<CycleOutcome>> {
        let respond = self.mode().should_respond(&inbound, &self.assistant_name);
        let session = self.sessions.get_or_create(&inbound.conversation_id)?;
        let mut window = session.lock().await;

        window.append(ingest::to_message(&inbound));
        window.trim()?;
        self.after_ingest(&inbound).await?;
        if let Some(refresher) = &self.refresher
            && let Err(e) = refresher.check(&inbound.author, &window).await
        {
            warn!(author_id = %inbound.author.id, error = %e, "Profile refresh check failed");
        }

        if !respond {
            return Ok(None);
        }

        let request = CycleRequest::new(inbound.conversation_id.clone())
            .with_requester(inbound.author.clone())
            .with_origin(inbound.message_ref.clone());
        let outcome = match self
            .orchestrator
            .run_cycle(&mut window, request, &self.cycle_token(&inbound.conversation_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                drop(window);
                self.report_failure(&inbound, &e).await;
                return Err(e);
            }
        };
        drop(window);

        self.deliver(OutboundReply {
            conversation_id: inbound.conversation_id,
            reply_to: inbound.message_ref,
            mention: None,
            content: outcome.reply.text(),
        })
        .await?;
        Ok(Some(outcome))
    }

    async fn after_ingest(&self, inbound: &InboundMessage) -> Result<()> {
        if let Some(memory) = &self.memory {
            memory.record_message(&inbound.author.id).await?;
        }
        debug!(
            conversation_id = %inbound.conversation_id,
            author_id = %inbound.author.id,
            "Message ingested"
        );
        self.publish(DomainEvent::MessageIngested {
            conversation_id: inbound.conversation_id.to_string(),
            author_id: inbound.author.id.to_string(),
            content_preview: ingest::preview(&inbound.content).chars().take(80).collect(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn report_failure(&self, inbound: &InboundMessage, e: &Error) {
        error!(conversation_id = %inbound.conversation_id, error = %e, "Completion failed");
        self.publish(DomainEvent::ErrorOccurred {
            context: format!("completion in {}", inbound.conversation_id),
            error_message: e.to_string(),
            timestamp: Utc::now(),
        });
        if matches!(e, Error::Cancelled) {
            return;
        }
        let notice = OutboundReply {
            conversation_id: inbound.conversation_id.clone(),
            reply_to: inbound.message_ref.clone(),
            mention: None,
            content: FAILURE_REPLY.into(),
        };
        if let Err(e) = self.deliver(notice).await {
            warn!(error = %e, "Failure notice not delivered");
        }
    }

    /// Run a fired reminder and post the result in its conversation.
    pub async fn handle_fired(&self, fired: FiredTask) -> Result<CycleOutcome> {
        let task = fired.task;
        let owner = Author::new(task.user_id.as_str(), self.display_name(&task.user_id).await);
        info!(
            task_id = %task.id,
            conversation_id = %task.conversation_id,
            "Running scheduled task"
        );

        let prompt = autonomous_prompt(&owner, &task.payload);
        let request = CycleRequest::new(task.conversation_id.clone())
            .with_requester(owner)
            .with_origin(task.origin.clone());

        let session = self.sessions.get_or_create(&task.conversation_id)?;
        let cancel = self.cycle_token(&task.conversation_id);
        let outcome = {
            let mut window = session.lock().await;
            self.orchestrator
                .run_isolated(&mut window, prompt, task.id, request, &cancel)
                .await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Scheduled task failed");
                self.publish(DomainEvent::ErrorOccurred {
                    context: format!("scheduled task {}", task.id),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e);
            }
        };

        let mention = task.origin.is_none().then(|| task.user_id.clone());
        self.deliver(OutboundReply {
            conversation_id: task.conversation_id,
            reply_to: task.origin,
            mention,
            content: outcome.reply.text(),
        })
        .await?;
        Ok(outcome)
    }

    /// The owner's name as last seen in the memory store, or their id.
    async fn display_name(&self, user_id: &murmur_core::message::UserId) -> String {
        if let Some(memory) = &self.memory
            && let Ok(profile) = memory.get_profile(user_id).await
            && let Some(name) = profile.facts.get("name")
        {
            return name.clone();
        }
        user_id.to_string()
    }

    async fn deliver(&self, reply: OutboundReply) -> Result<()> {
        let chunks = reply.chunks();
        let total = chunks.len();
        for (i, content) in chunks.into_iter().enumerate() {
            // only the first chunk is threaded to the origin
            let piece = OutboundReply {
                conversation_id: reply.conversation_id.clone(),
                reply_to: if i == 0 { reply.reply_to.clone() } else { None },
                mention: if i + 1 == total { reply.mention.clone() } else { None },
                content,
            };
            self.channel.send(piece).await?;
        }
        Ok(())
    }

    /// Clear a conversation's window, keeping its leading message.
    pub async fn forget(&self, conversation_id: &ConversationId) -> bool {
        let Some(session) = self.sessions.get(conversation_id) else {
            return false;
        };
        session.lock().await.clear();
        info!(conversation_id = %conversation_id, "Conversation forgotten");
        true
    }

    pub async fn stats(&self, conversation_id: &ConversationId) -> Option<WindowStats> {
        let session = self.sessions.get(conversation_id)?;
        let stats = session.lock().await.stats();
        Some(stats)
    }

    fn cycle_tokens(&self) -> MutexGuard<'_, HashMap<ConversationId, CancellationToken>> {
        self.cycle_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A token for one cycle in `conversation_id`.
    fn cycle_token(&self, conversation_id: &ConversationId) -> CancellationToken {
        self.cycle_tokens()
            .entry(conversation_id.clone())
            .or_insert_with(|| self.shutdown.child_token())
            .child_token()
    }

    /// Abort the cycles running or queued on the session lock of one
    /// conversation. Other conversations are untouched, and later events
    /// in this one run normally. Returns false if no cycle has started
    /// there since the last cancel.
    pub fn cancel(&self, conversation_id: &ConversationId) -> bool {
        let Some(token) = self.cycle_tokens().remove(conversation_id) else {
            return false;
        };
        token.cancel();
        info!(conversation_id = %conversation_id, "Conversation cycles cancelled");
        true
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<ConversationId, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_lanes(&self) -> usize {
        self.lanes().len()
    }

    /// Queue `event` on its conversation's lane, starting the lane if needed.
    pub fn submit(self: &Arc<Self>, event: PipelineEvent) {
        let conversation_id = event.conversation_id().clone();
        let mut lanes = self.lanes();

        let event = match lanes.get(&conversation_id) {
            Some(lane) => match lane.tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let lane = self.spawn_lane(conversation_id.clone());
        if lane.tx.send(event).is_err() {
            warn!(conversation_id = %conversation_id, "Lane closed before first event");
        }
        lanes.insert(conversation_id, lane);
    }

    fn spawn_lane(self: &Arc<Self>, conversation_id: ConversationId) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::clone(self);
        debug!(conversation_id = %conversation_id, "Lane started");

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = engine.shutdown.cancelled() => None,
                    next = tokio::time::timeout(engine.lane_idle, rx.recv()) => match next {
                        Ok(event) => event,
                        Err(_) if engine.retire_lane(&conversation_id, generation, &rx) => None,
                        Err(_) => continue,
                    },
                };
                let Some(event) = next else { break };
                engine.process(event).await;
            }
            debug!(conversation_id = %conversation_id, "Lane stopped");
        });

        Lane { generation, tx }
    }

    /// Drop an idle lane from the table unless events arrived meanwhile.
    fn retire_lane(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
        rx: &mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> bool {
        let mut lanes = self.lanes();
        if !rx.is_empty() {
            return false;
        }
        if lanes
            .get(conversation_id)
            .is_some_and(|lane| lane.generation == generation)
        {
            lanes.remove(conversation_id);
            self.cycle_tokens().remove(conversation_id);
        }
        true
    }

    async fn process(&self, event: PipelineEvent) {
        let result = match event {
            PipelineEvent::Inbound(inbound) => self.handle_inbound(inbound).await.map(|_| ()),
            PipelineEvent::Fired(fired) => self.handle_fired(fired).await.map(|_| ()),
        };
        if let Err(e) = result {
            debug!(error = %e, "Lane event failed");
        }
    }

    /// Route both input streams into lanes until shutdown or until both
    /// senders are dropped.
    pub fn start(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut fired: mpsc::Receiver<FiredTask>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut inbound_open, mut fired_open) = (true, true);
            while inbound_open || fired_open {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    msg = inbound.recv(), if inbound_open => match msg {
                        Some(msg) => self.submit(PipelineEvent::Inbound(msg)),
                        None => inbound_open = false,
                    },
                    task = fired.recv(), if fired_open => match task {
                        Some(task) => self.submit(PipelineEvent::Fired(task)),
                        None => fired_open = false,
                    },
                }
            }
            info!("Chat engine stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The message a fired reminder runs as.
pub fn autonomous_prompt(owner: &Author, description: &str) -> Message {
    Message::user(format!(
        "[SCHEDULED TASK]\n\
         Original request from {name} ({id}): {description}\n\n\
         You are now carrying out the task you scheduled earlier at {name}'s request.\n\
         - Do not ask follow-up questions; nobody will answer them.\n\
         - Do your best with what you know, using your tools if needed.\n\
         - Speak directly to {name}.\n\
         - Do not add a summary or report at the end.\n\
         - If you cannot do everything, say exactly what you did manage.",
        name = owner.name,
        id = owner.id,
    ))
    .with_author(owner.clone())
}
