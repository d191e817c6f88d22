//! End-to-end integration tests for murmur.
//!
//! These tests drive the full pipeline from inbound chat messages to
//! outbound replies: ingestion, sessions, the completion cycle, the built-in
//! tools, the scheduler loop and both storage backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use murmur_agent::{
    ChatEngine, ChatMode, CompletionOrchestrator, OrchestratorSettings, PromptBuilder, SessionManager,
    WindowConfig,
};
use murmur_core::channel::{Channel, InboundMessage, OutboundReply};
use murmur_core::error::{ChannelError, ProviderError, ScheduleError};
use murmur_core::memory::MemoryStore;
use murmur_core::message::{Author, ConversationId, MessageRef, Role, TaskId, ToolCallRecord, UserId};
use murmur_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use murmur_core::tool::ChainCounter;
use murmur_memory::{InMemoryMemoryStore, SqliteMemoryStore};
use murmur_scheduler::{
    FiredTask, InMemoryTaskStore, NewTask, SchedulerSettings, SqliteTaskStore, TaskScheduler, TaskStatus,
    TaskStore,
};
use murmur_tools::default_registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Mock Provider ────────────────────────────────────────────────────────

/// A mock provider that returns scripted responses in sequence.
struct ScriptedProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    call_count: Mutex<usize>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Duration,
}

impl ScriptedProvider {
    fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    fn request(&self, index: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let resp = {
            let mut count = self.call_count.lock().unwrap();
            let responses = self.responses.lock().unwrap();
            if *count >= responses.len() {
                panic!(
                    "ScriptedProvider exhausted: call #{}, have {}",
                    *count,
                    responses.len()
                );
            }
            let resp = responses[*count].clone();
            *count += 1;
            resp
        };
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(resp)
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: text.into(),
        tool_calls: vec![],
        usage: usage(),
        model: "mock".into(),
    }
}

fn tool_response(tool_calls: Vec<ToolCallRecord>) -> ProviderResponse {
    ProviderResponse {
        content: String::new(),
        tool_calls,
        usage: usage(),
        model: "mock".into(),
    }
}

fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCallRecord {
    ToolCallRecord {
        id: id.into(),
        name: name.into(),
        arguments: args,
    }
}

// ── Test Channel and Wiring ──────────────────────────────────────────────

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<OutboundReply>>,
}

impl RecordingChannel {
    fn sent(&self) -> Vec<OutboundReply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, reply: OutboundReply) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(reply);
        Ok(())
    }
}

struct Harness {
    engine: Arc<ChatEngine>,
    provider: Arc<ScriptedProvider>,
    channel: Arc<RecordingChannel>,
    scheduler: Arc<TaskScheduler>,
    memory: Arc<dyn MemoryStore>,
}

fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(provider, Arc::new(InMemoryMemoryStore::new()), Arc::new(InMemoryTaskStore::new()))
}

fn harness_with(provider: ScriptedProvider, memory: Arc<dyn MemoryStore>, tasks: Arc<dyn TaskStore>) -> Harness {
    let provider = Arc::new(provider);
    let scheduler = Arc::new(TaskScheduler::new(tasks, SchedulerSettings::default()));
    let tools = Arc::new(default_registry(scheduler.clone(), memory.clone()));
    let orchestrator = CompletionOrchestrator::new(
        provider.clone(),
        tools,
        PromptBuilder::new("You are {name}. It is {weekday}.", "murmur"),
        OrchestratorSettings::default(),
    )
    .with_memory(memory.clone());
    let sessions = SessionManager::new(WindowConfig::default(), None).unwrap();
    let channel = Arc::new(RecordingChannel::default());
    let engine = ChatEngine::new(Arc::new(sessions), Arc::new(orchestrator), channel.clone(), "murmur")
        .with_memory(memory.clone())
        .with_mode(ChatMode::Strict);

    Harness {
        engine: Arc::new(engine),
        provider,
        channel,
        scheduler,
        memory,
    }
}

fn general() -> ConversationId {
    ConversationId::from("general")
}

fn from_alice(content: &str, msg_ref: &str) -> InboundMessage {
    InboundMessage::new(general(), Author::new("42", "Alice"), content).with_ref(msg_ref)
}

async fn window_roles(engine: &ChatEngine) -> Vec<Role> {
    let session = engine.sessions().get(&general()).unwrap();
    let snapshot = session.lock().await.snapshot();
    snapshot.iter().map(|m| m.role).collect()
}

// ── E2E: Completion Cycle ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_three_messages_and_calculator_leave_five_messages() {
    let h = harness(ScriptedProvider::new(vec![
        tool_response(vec![make_tool_call(
            "call_1",
            "calculator",
            serde_json::json!({"expression": "17 * 3"}),
        )]),
        text_response("17 times 3 is 51."),
    ]));

    h.engine.handle_inbound(from_alice("hi all", "m-1")).await.unwrap();
    h.engine.handle_inbound(from_alice("I have a question", "m-2")).await.unwrap();
    let outcome = h
        .engine
        .handle_inbound(from_alice("@murmur what is 17*3?", "m-3").addressed())
        .await
        .unwrap()
        .expect("addressed message should be answered");

    assert_eq!(outcome.rounds, 1);
    assert_eq!(h.provider.calls(), 2);
    assert_eq!(
        window_roles(&h.engine).await,
        vec![Role::User, Role::User, Role::User, Role::Tool, Role::Assistant]
    );

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "17 times 3 is 51.");
    assert_eq!(sent[0].reply_to, Some(MessageRef::from("m-3")));

    let tool_payload: serde_json::Value = serde_json::from_str(&outcome.tool_messages[0].text()).unwrap();
    assert_eq!(tool_payload["result"], 51);
}

#[tokio::test]
async fn e2e_concurrent_requests_are_sequential() {
    let h = harness(
        ScriptedProvider::new(vec![text_response("answer one"), text_response("answer two")])
            .with_delay(Duration::from_millis(30)),
    );

    let (a, b) = tokio::join!(
        h.engine.handle_inbound(from_alice("first", "m-1").addressed()),
        h.engine.handle_inbound(from_alice("second", "m-2").addressed()),
    );
    a.unwrap();
    b.unwrap();

    let session = h.engine.sessions().get(&general()).unwrap();
    let texts: Vec<String> = session.lock().await.snapshot().iter().map(|m| m.text()).collect();
    assert_eq!(texts.len(), 4);
    // each question is immediately followed by its own answer
    assert!(texts[0].ends_with("first"));
    assert_eq!(texts[1], "answer one");
    assert!(texts[2].ends_with("second"));
    assert_eq!(texts[3], "answer two");
}

#[tokio::test]
async fn e2e_unknown_tool_is_reported_not_fatal() {
    let h = harness(ScriptedProvider::new(vec![
        tool_response(vec![make_tool_call("call_1", "web_search", serde_json::json!({"q": "x"}))]),
        text_response("I can't search the web."),
    ]));

    let outcome = h
        .engine
        .handle_inbound(from_alice("search for x", "m-1").addressed())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.reply.text(), "I can't search the web.");
    assert!(outcome.tool_messages[0].text().contains("unknown tool 'web_search'"));

    // the model saw the error on its second call
    let second = h.provider.request(1);
    assert!(second.messages.iter().any(|m| m.role == Role::Tool && m.text().contains("error")));
}

#[tokio::test]
async fn e2e_profile_update_reaches_next_cycle() {
    let h = harness(ScriptedProvider::new(vec![
        tool_response(vec![make_tool_call(
            "call_1",
            "update_user_profile",
            serde_json::json!({"facts": {"City": "Lyon"}}),
        )]),
        text_response("Noted!"),
        text_response("You live in Lyon."),
    ]));

    h.engine
        .handle_inbound(from_alice("@murmur I live in Lyon", "m-1").addressed())
        .await
        .unwrap();
    h.engine
        .handle_inbound(from_alice("@murmur where do I live?", "m-2").addressed())
        .await
        .unwrap();

    let third = h.provider.request(2);
    assert_eq!(third.messages[0].role, Role::Developer);
    assert!(third.messages[0].text().contains("city=Lyon"));
    // the first call of the first cycle predates the fact
    assert!(!h.provider.request(0).messages[0].text().contains("Lyon"));
}

// ── E2E: Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_sixth_task_in_one_response_is_refused() {
    let calls = (1..=6)
        .map(|i| {
            make_tool_call(
                &format!("call_{i}"),
                "schedule_task",
                serde_json::json!({"task_description": format!("reminder {i}"), "delay_minutes": 10 * i}),
            )
        })
        .collect();
    let h = harness(ScriptedProvider::new(vec![
        tool_response(calls),
        text_response("Five reminders set."),
    ]));

    let outcome = h
        .engine
        .handle_inbound(from_alice("@murmur remind me six times", "m-1").addressed())
        .await
        .unwrap()
        .unwrap();

    let payloads: Vec<serde_json::Value> = outcome
        .tool_messages
        .iter()
        .map(|m| serde_json::from_str(&m.text()).unwrap())
        .collect();
    assert_eq!(payloads.len(), 6);
    assert!(payloads[..5].iter().all(|p| p["success"] == true));
    assert!(
        payloads[5]["error"]
            .as_str()
            .unwrap()
            .contains("Schedule limit exceeded")
    );

    let pending = h.scheduler.list_pending(&UserId::from("42")).await.unwrap();
    assert_eq!(pending.len(), 5);
    assert!(pending.iter().all(|t| t.origin == Some(MessageRef::from("m-1"))));
}

#[tokio::test]
async fn e2e_chain_cap_resets_between_responses() {
    let batch = |offset: usize| {
        tool_response(
            (0..3)
                .map(|i| {
                    make_tool_call(
                        &format!("call_{}", offset + i),
                        "schedule_task",
                        serde_json::json!({"task_description": "stretch", "delay_minutes": 30}),
                    )
                })
                .collect(),
        )
    };
    let h = harness(ScriptedProvider::new(vec![
        batch(0),
        text_response("ok"),
        batch(3),
        text_response("ok again"),
    ]));

    for msg_ref in ["m-1", "m-2"] {
        h.engine
            .handle_inbound(from_alice("@murmur three more", msg_ref).addressed())
            .await
            .unwrap();
    }
    assert_eq!(h.scheduler.list_pending(&UserId::from("42")).await.unwrap().len(), 6);
}

#[tokio::test]
async fn e2e_cancel_requires_ownership() {
    let h = harness(ScriptedProvider::new(vec![]));
    let task = h
        .scheduler
        .schedule(
            &ChainCounter::new(),
            NewTask {
                user_id: UserId::from("alice"),
                conversation_id: general(),
                origin: None,
                due_at: Utc::now() + chrono::Duration::hours(1),
                payload: "water the plants".into(),
            },
        )
        .await
        .unwrap();

    let err = h.scheduler.cancel(task.id, &UserId::from("bob")).await.unwrap_err();
    assert!(matches!(err, ScheduleError::Forbidden { .. }));

    let cancelled = h.scheduler.cancel(task.id, &UserId::from("alice")).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(h.scheduler.list_pending(&UserId::from("alice")).await.unwrap().is_empty());

    let again = h.scheduler.cancel(task.id, &UserId::from("alice")).await.unwrap_err();
    assert!(matches!(again, ScheduleError::NotFound(_)));
    let missing = h.scheduler.cancel(TaskId(999), &UserId::from("alice")).await.unwrap_err();
    assert!(matches!(missing, ScheduleError::NotFound(_)));
}

#[tokio::test]
async fn e2e_fired_task_answers_once_in_its_conversation() {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let h = harness_with(
        ScriptedProvider::new(vec![text_response("Time to drink water, Alice!")]),
        Arc::new(InMemoryMemoryStore::new()),
        store.clone(),
    );
    let task = h
        .scheduler
        .schedule(
            &ChainCounter::new(),
            NewTask {
                user_id: UserId::from("42"),
                conversation_id: general(),
                origin: Some(MessageRef::from("m-7")),
                due_at: Utc::now() - chrono::Duration::seconds(1),
                payload: "remind me to drink water".into(),
            },
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let (fire_tx, mut fire_rx) = mpsc::channel::<FiredTask>(8);
    let handle = h.scheduler.clone().start(fire_tx, shutdown.clone());

    let fired = tokio::time::timeout(Duration::from_secs(5), fire_rx.recv())
        .await
        .expect("task should fire")
        .unwrap();
    assert_eq!(fired.task.id, task.id);
    h.engine.handle_fired(fired).await.unwrap();

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reply_to, Some(MessageRef::from("m-7")));
    assert_eq!(window_roles(&h.engine).await, vec![Role::Assistant]);

    // a restarted loop on the same store has nothing left to fire
    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(store.get(task.id).await.unwrap().unwrap().status, TaskStatus::Fired);

    let restarted = Arc::new(TaskScheduler::new(store, SchedulerSettings::default()));
    let shutdown = CancellationToken::new();
    let (fire_tx, mut fire_rx) = mpsc::channel::<FiredTask>(8);
    let handle = restarted.start(fire_tx, shutdown.clone());
    assert!(
        tokio::time::timeout(Duration::from_millis(300), fire_rx.recv())
            .await
            .is_err()
    );
    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn e2e_overdue_task_fires_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("murmur.db").display());

    {
        let store = SqliteTaskStore::new(&url).await.unwrap();
        store
            .insert(
                NewTask {
                    user_id: UserId::from("42"),
                    conversation_id: general(),
                    origin: None,
                    due_at: Utc::now() - chrono::Duration::minutes(30),
                    payload: "missed while offline".into(),
                },
                10,
            )
            .await
            .unwrap();
    }

    let store = Arc::new(SqliteTaskStore::new(&url).await.unwrap());
    let scheduler = Arc::new(TaskScheduler::new(store, SchedulerSettings::default()));
    let shutdown = CancellationToken::new();
    let (fire_tx, mut fire_rx) = mpsc::channel(8);
    let handle = scheduler.clone().start(fire_tx, shutdown.clone());

    let fired = tokio::time::timeout(Duration::from_secs(5), fire_rx.recv())
        .await
        .expect("overdue task should fire on reload")
        .unwrap();
    assert_eq!(fired.task.payload, "missed while offline");
    assert_eq!(fired.task.status, TaskStatus::Fired);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn e2e_fired_task_without_origin_mentions_owner() {
    let h = harness(ScriptedProvider::new(vec![text_response("Stand up and stretch!")]));
    let now = Utc::now();
    let fired = FiredTask {
        task: murmur_scheduler::ScheduledTask {
            id: TaskId(1),
            user_id: UserId::from("42"),
            conversation_id: general(),
            origin: None,
            due_at: now,
            payload: "stretch".into(),
            status: TaskStatus::Fired,
            created_at: now,
            updated_at: now,
        },
        fired_at: now,
    };
    h.engine.handle_fired(fired).await.unwrap();

    let sent = h.channel.sent();
    assert_eq!(sent[0].mention, Some(UserId::from("42")));
    assert!(sent[0].reply_to.is_none());
}

// ── E2E: Memory ──────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_reset_profile_leaves_it_empty() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("memory.db").display());
    let store = SqliteMemoryStore::new(&url).await.unwrap();
    let alice = UserId::from("42");

    store
        .update_facts(&alice, [("pet".to_string(), "cat".to_string())].into())
        .await
        .unwrap();
    assert!(!store.get_profile(&alice).await.unwrap().is_empty());

    assert!(store.reset(&alice).await.unwrap());
    assert!(store.get_profile(&alice).await.unwrap().is_empty());
    assert!(!store.reset(&alice).await.unwrap());
}

#[tokio::test]
async fn e2e_eviction_keeps_profiles_and_tasks() {
    let h = harness(ScriptedProvider::new(vec![]));
    h.memory
        .update_facts(&UserId::from("42"), [("city".to_string(), "Lyon".to_string())].into())
        .await
        .unwrap();
    h.scheduler
        .schedule(
            &ChainCounter::new(),
            NewTask {
                user_id: UserId::from("42"),
                conversation_id: general(),
                origin: None,
                due_at: Utc::now() + chrono::Duration::hours(2),
                payload: "call mom".into(),
            },
        )
        .await
        .unwrap();
    h.engine.handle_inbound(from_alice("hello", "m-1")).await.unwrap();

    let later = Utc::now() + chrono::Duration::hours(12);
    assert_eq!(h.engine.sessions().evict_idle_at(later, Duration::from_secs(3600)), 1);
    assert!(h.engine.sessions().get(&general()).is_none());

    assert!(!h.memory.get_profile(&UserId::from("42")).await.unwrap().is_empty());
    assert_eq!(h.scheduler.list_pending(&UserId::from("42")).await.unwrap().len(), 1);
}

// ── E2E: Configuration ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_config_defaults_and_validation() {
    let config = murmur_config::AppConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.orchestrator.max_tool_rounds, 3);
    assert_eq!(config.scheduler.chain_cap, 5);

    let parsed: murmur_config::AppConfig = toml::from_str(&murmur_config::AppConfig::default_toml()).unwrap();
    assert_eq!(parsed.provider.model, config.provider.model);

    let mut bad = config.clone();
    bad.orchestrator.max_tool_rounds = 0;
    assert!(bad.validate().is_err());

    let window = WindowConfig::from(&config.context);
    assert_eq!(window.token_budget, config.context.token_budget);
}
