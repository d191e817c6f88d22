//! The completion cycle: model call, tool dispatch, repeat.
//!
//! ```text
//! BUILD_REQUEST -> AWAIT_MODEL -> FINAL -> DONE
//!                      |   ^
//!                      v   |
//!                 DISPATCH_TOOLS
//! ```
//!
//! Tool responses are appended to the window as each round completes, in
//! call order. A model call that times out or is cancelled discards what
//! the cycle appended; a cycle that runs out of tool rounds keeps it.
//! When the model rejects an image URL, the window's images are dropped
//! for good and the call is repeated once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use murmur_config::AppConfig;
use murmur_core::error::{Error, ProviderError, Result};
use murmur_core::event::{DomainEvent, EventBus};
use murmur_core::memory::MemoryStore;
use murmur_core::message::{Author, Component, ConversationId, Message, MessageRef, TaskId, ToolCallRecord};
use murmur_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
use murmur_core::tool::{ToolContext, ToolRegistry};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ContextWindow, PromptBuilder};

/// Request-only message sent after an empty reply.
pub const EMPTY_REPLY_NUDGE: &str = "Answer the last message now.";

/// Model parameters and loop limits.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Tool rounds allowed per cycle; one more is an error.
    pub max_tool_rounds: u32,
    pub model_timeout: Duration,
    pub empty_reply_retry: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: Some(1024),
            max_tool_rounds: 3,
            model_timeout: Duration::from_secs(60),
            empty_reply_retry: true,
        }
    }
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.provider.model.clone(),
            temperature: config.provider.temperature,
            max_tokens: Some(config.provider.max_completion_tokens),
            max_tool_rounds: config.orchestrator.max_tool_rounds,
            model_timeout: Duration::from_secs(config.provider.timeout_secs),
            empty_reply_retry: config.orchestrator.empty_reply_retry,
        }
    }
}

/// Who and what a cycle answers.
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub conversation_id: ConversationId,
    /// The user whose message triggered the cycle
    pub requester: Option<Author>,
    /// Platform reference of that message
    pub origin: Option<MessageRef>,
}

impl CycleRequest {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            requester: None,
            origin: None,
        }
    }

    pub fn with_requester(mut self, requester: Author) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn with_origin(mut self, origin: Option<MessageRef>) -> Self {
        self.origin = origin;
        self
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            requester: self.requester.clone(),
            origin: self.origin.clone(),
            ..ToolContext::new(self.conversation_id.clone())
        }
    }
}

/// Result of a successful cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// The final assistant message, already in the window
    pub reply: Message,
    /// Tool responses of this cycle, in the order they were appended
    pub tool_messages: Vec<Message>,
    /// Tool rounds used
    pub rounds: u32,
    pub usage: Usage,
}

impl CycleOutcome {
    /// Names of the tools that ran, first use first, without repeats.
    pub fn tools_used(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in self
            .tool_messages
            .iter()
            .filter_map(|m| m.tool_call.as_ref())
            .map(|c| c.name.as_str())
        {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

pub struct CompletionOrchestrator {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    prompt: PromptBuilder,
    settings: OrchestratorSettings,
    events: Option<Arc<EventBus>>,
}

impl CompletionOrchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        prompt: PromptBuilder,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            memory: None,
            prompt,
            settings,
            events: None,
        }
    }

    /// Read requester profiles into the developer prompt.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Run one cycle against `window`. The caller holds the session lock.
    pub async fn run_cycle(
        &self,
        window: &mut ContextWindow,
        request: CycleRequest,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let conversation_id = request.conversation_id.clone();
        info!(
            conversation_id = %conversation_id,
            messages = window.len(),
            "Starting completion cycle"
        );

        // BUILD_REQUEST: one developer prompt and one profile read per cycle
        let developer = self.developer_prompt(&request).await?;
        let definitions = self.tools.list();
        let ctx = request.tool_context();

        let mut appended = 0usize;
        let mut tool_messages = Vec::new();
        let mut usage = Usage::default();
        let mut rounds = 0u32;
        let mut nudge: Option<Message> = None;
        let mut retried = false;
        let mut images_dropped = false;

        loop {
            debug!(conversation_id = %conversation_id, iteration = rounds + 1, "Awaiting model");

            let messages: Vec<Message> = std::iter::once(developer.clone())
                .chain(window.snapshot())
                .chain(nudge.clone())
                .collect();

            let response = match self.await_model(messages, &definitions, cancel).await {
                Ok(response) => response,
                Err(e @ (Error::ModelTimeout { .. } | Error::Cancelled)) => {
                    window.pop_newest(appended);
                    warn!(conversation_id = %conversation_id, error = %e, "Cycle aborted");
                    return Err(e);
                }
                // an unreachable image would fail every later cycle too
                Err(Error::Provider(e)) if e.is_invalid_image() && !images_dropped => {
                    images_dropped = true;
                    let stripped = window.strip_images();
                    warn!(
                        conversation_id = %conversation_id,
                        stripped,
                        "Model rejected an image, retrying without images"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            nudge = None;
            if let Some(u) = &response.usage {
                usage.add(u);
            }

            if !response.wants_tools() {
                let content = response.content.trim();
                if content.is_empty() && self.settings.empty_reply_retry && !retried {
                    debug!(conversation_id = %conversation_id, "Empty reply, retrying with a nudge");
                    retried = true;
                    nudge = Some(Message::developer(vec![Component::text(EMPTY_REPLY_NUDGE)]));
                    continue;
                }

                // FINAL
                let reply = Message::assistant(content);
                window.append(reply.clone());
                window.trim()?;

                info!(
                    conversation_id = %conversation_id,
                    rounds,
                    tokens = usage.total_tokens,
                    "Completion cycle finished"
                );
                self.publish(DomainEvent::CompletionFinished {
                    conversation_id: conversation_id.to_string(),
                    model: response.model,
                    rounds,
                    tokens_used: usage.total_tokens,
                    timestamp: Utc::now(),
                });
                return Ok(CycleOutcome {
                    reply,
                    tool_messages,
                    rounds,
                    usage,
                });
            }

            // DISPATCH_TOOLS
            rounds += 1;
            if rounds > self.settings.max_tool_rounds {
                warn!(
                    conversation_id = %conversation_id,
                    max_rounds = self.settings.max_tool_rounds,
                    "Tool loop limit reached"
                );
                return Err(Error::ToolLoopExceeded {
                    max_rounds: self.settings.max_tool_rounds,
                });
            }

            debug!(
                conversation_id = %conversation_id,
                tool_count = response.tool_calls.len(),
                "Executing tool calls"
            );
            let dispatch = join_all(response.tool_calls.iter().map(|call| self.dispatch(call, &ctx)));
            let payloads = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    window.pop_newest(appended);
                    return Err(Error::Cancelled);
                }
                payloads = dispatch => payloads,
            };

            for (call, payload) in response.tool_calls.into_iter().zip(payloads) {
                let message = Message::tool_response(call, &payload);
                window.append(message.clone());
                tool_messages.push(message);
                appended += 1;
            }
        }
    }

    /// Run a scheduled task in a scratch window.
    ///
    /// Only the final reply is merged into `live`, tagged with the task id.
    /// The scratch window's tool traffic is discarded.
    pub async fn run_isolated(
        &self,
        live: &mut ContextWindow,
        task_prompt: Message,
        task_id: TaskId,
        request: CycleRequest,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let mut scratch = ContextWindow::new(*live.config());
        scratch.append(task_prompt);

        let mut outcome = self.run_cycle(&mut scratch, request, cancel).await?;
        outcome.reply = outcome
            .reply
            .with_metadata("autonomous_task", true)
            .with_metadata("task_id", task_id.0);
        live.append(outcome.reply.clone());
        live.trim()?;
        Ok(outcome)
    }

    async fn developer_prompt(&self, request: &CycleRequest) -> Result<Message> {
        let (Some(memory), Some(requester)) = (&self.memory, &request.requester) else {
            return Ok(self.prompt.build(None));
        };
        let profile = memory.get_profile(&requester.id).await?;
        Ok(self.prompt.build(Some((&profile, &requester.name))))
    }

    /// AWAIT_MODEL, bounded by the deadline and the caller's token.
    async fn await_model(
        &self,
        messages: Vec<Message>,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let request = ProviderRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: tools.to_vec(),
        };
        let timeout_secs = self.settings.model_timeout.as_secs();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.settings.model_timeout, self.provider.complete(request)) => {
                match result {
                    Err(_) | Ok(Err(ProviderError::Timeout(_))) => Err(Error::ModelTimeout { timeout_secs }),
                    Ok(response) => Ok(response?),
                }
            }
        }
    }

    /// Run one tool call. Failures become an error payload.
    async fn dispatch(&self, call: &ToolCallRecord, ctx: &ToolContext) -> Value {
        let start = Instant::now();
        let (payload, success) = match self.tools.get(&call.name) {
            None => {
                warn!(tool = %call.name, "Model called an unknown tool");
                (json!({"error": format!("unknown tool '{}'", call.name)}), false)
            }
            Some(tool) => match tool.execute(call.arguments.clone(), ctx).await {
                Ok(result) => (result.payload, result.success),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    (json!({"error": e.to_string()}), false)
                }
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(tool = %call.name, success, duration_ms, "Tool executed");
        self.publish(DomainEvent::ToolExecuted {
            conversation_id: ctx.conversation_id.to_string(),
            tool_name: call.name.clone(),
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WindowConfig;
    use crate::session::Session;
    use crate::testing::{ScriptedProvider, Step, call, image_rejected};
    use murmur_core::message::{Role, UserId};
    use murmur_memory::InMemoryMemoryStore;
    use murmur_scheduler::{InMemoryTaskStore, SchedulerSettings, TaskScheduler};
    use murmur_tools::{CalculatorTool, ScheduleTaskTool};
    use std::collections::BTreeMap;

    fn registry() -> Arc<ToolRegistry> {
        let tools = ToolRegistry::new();
        tools.add(Arc::new(CalculatorTool));
        Arc::new(tools)
    }

    fn orchestrator(provider: Arc<ScriptedProvider>, settings: OrchestratorSettings) -> CompletionOrchestrator {
        CompletionOrchestrator::new(
            provider,
            registry(),
            PromptBuilder::new("You are {name}.", "murmur"),
            settings,
        )
    }

    fn window(users: &[&str]) -> ContextWindow {
        let mut w = ContextWindow::new(WindowConfig::default());
        for u in users {
            w.append(Message::user(*u));
        }
        w
    }

    fn request() -> CycleRequest {
        CycleRequest::new(ConversationId::from("general")).with_requester(Author::new("42", "Alice"))
    }

    fn roles(w: &ContextWindow) -> Vec<Role> {
        w.snapshot().iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn tool_round_then_final_reply() {
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::tool_calls(vec![call("c1", "calculator", json!({"expression": "6*7"}))]),
            ProviderResponse::text("It is 42."),
        ]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut w = window(&["hi", "quick question", "what is 6*7?"]);

        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.reply.text(), "It is 42.");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.tools_used(), vec!["calculator"]);
        assert_eq!(w.len(), 5);
        assert_eq!(
            roles(&w),
            vec![Role::User, Role::User, Role::User, Role::Tool, Role::Assistant]
        );
        let tool_msg = &w.snapshot()[3];
        assert!(tool_msg.text().contains("42"));
        assert_eq!(tool_msg.tool_call_id(), Some("c1"));

        // second model call saw the tool result, behind a fresh developer prompt
        let second = provider.request(1);
        assert_eq!(second.messages[0].role, Role::Developer);
        assert_eq!(second.messages.last().unwrap().role, Role::Tool);
        assert!(!second.tools.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_payload() {
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::tool_calls(vec![call("c1", "teleport", json!({}))]),
            ProviderResponse::text("Sorry, I can't do that."),
        ]));
        let orch = orchestrator(provider, OrchestratorSettings::default());
        let mut w = window(&["beam me up"]);

        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        let payload: Value = serde_json::from_str(&outcome.tool_messages[0].text()).unwrap();
        assert_eq!(payload["error"], "unknown tool 'teleport'");
        assert_eq!(w.len(), 3);
    }

    #[tokio::test]
    async fn calls_in_one_round_keep_their_order() {
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::tool_calls(vec![
                call("a", "calculator", json!({"expression": "1+1"})),
                call("b", "calculator", json!({"expression": "2+2"})),
                call("c", "calculator", json!({"expression": "3+3"})),
            ]),
            ProviderResponse::text("2, 4 and 6"),
        ]));
        let orch = orchestrator(provider, OrchestratorSettings::default());
        let mut w = window(&["sums please"]);

        orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        let ids: Vec<_> = w
            .snapshot()
            .iter()
            .filter_map(|m| m.tool_call_id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn loop_limit_keeps_tool_messages() {
        let round = || ProviderResponse::tool_calls(vec![call("c", "calculator", json!({"expression": "1"}))]);
        let provider = Arc::new(ScriptedProvider::replies([round(), round(), round()]));
        let settings = OrchestratorSettings {
            max_tool_rounds: 2,
            ..OrchestratorSettings::default()
        };
        let orch = orchestrator(provider.clone(), settings);
        let mut w = window(&["loop forever"]);

        let err = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ToolLoopExceeded { max_rounds: 2 }));
        assert_eq!(provider.calls(), 3);
        assert_eq!(roles(&w), vec![Role::User, Role::Tool, Role::Tool]);
    }

    #[tokio::test(start_paused = true)]
    async fn model_timeout_rolls_back_the_cycle() {
        let provider = Arc::new(ScriptedProvider::new([
            Step::Reply(ProviderResponse::tool_calls(vec![call(
                "c1",
                "calculator",
                json!({"expression": "2"}),
            )])),
            Step::Hang,
        ]));
        let settings = OrchestratorSettings {
            model_timeout: Duration::from_secs(5),
            ..OrchestratorSettings::default()
        };
        let orch = orchestrator(provider, settings);
        let mut w = window(&["slow one"]);

        let err = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ModelTimeout { timeout_secs: 5 }));
        assert_eq!(roles(&w), vec![Role::User]);
    }

    #[tokio::test]
    async fn cancellation_rolls_back_the_cycle() {
        let provider = Arc::new(ScriptedProvider::new([Step::Hang]));
        let orch = orchestrator(provider, OrchestratorSettings::default());
        let mut w = window(&["never mind"]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = orch.run_cycle(&mut w, request(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(w.len(), 1);
    }

    #[tokio::test]
    async fn rejected_image_is_dropped_and_the_call_retried() {
        let provider = Arc::new(ScriptedProvider::new([
            Step::Fail(image_rejected()),
            Step::Reply(ProviderResponse::text("Nice cat.")),
            Step::Reply(ProviderResponse::text("Still here.")),
        ]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut w = ContextWindow::new(WindowConfig::default());
        w.append(Message::new(
            Role::User,
            vec![Component::text("look"), Component::image("https://gone.test/cat.png")],
        ));

        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.reply.text(), "Nice cat.");
        assert!(provider.request(0).messages.iter().any(Message::has_image));
        assert!(!provider.request(1).messages.iter().any(Message::has_image));
        assert!(w.snapshot().iter().all(|m| !m.has_image()));
        assert_eq!(w.snapshot()[0].text(), "look");

        // the conversation keeps working afterwards
        w.append(Message::user("and now?"));
        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.reply.text(), "Still here.");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn image_rejection_is_retried_only_once() {
        let provider = Arc::new(ScriptedProvider::new([
            Step::Fail(image_rejected()),
            Step::Fail(image_rejected()),
        ]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut w = window(&["hi"]);

        let err = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ref e) if e.is_invalid_image()));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn other_provider_errors_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::new([Step::Fail(ProviderError::Network(
            "connection reset".into(),
        ))]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut w = window(&["hi"]);

        let err = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::Network(_))));
        assert_eq!(provider.calls(), 1);
        assert_eq!(w.len(), 1);
    }

    #[tokio::test]
    async fn empty_reply_is_retried_once_with_a_nudge() {
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::text("  "),
            ProviderResponse::text("Here you go."),
        ]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut w = window(&["hello?"]);

        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.reply.text(), "Here you go.");
        assert_eq!(outcome.rounds, 0);

        let retry = provider.request(1);
        let nudge = retry.messages.last().unwrap();
        assert_eq!(nudge.role, Role::Developer);
        assert_eq!(nudge.text(), EMPTY_REPLY_NUDGE);
        // the nudge is request-only
        assert_eq!(roles(&w), vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn second_empty_reply_is_kept() {
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::text(""),
            ProviderResponse::text(""),
        ]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut w = window(&["hello?"]);

        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.reply.text(), "");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn chain_cap_applies_within_one_cycle() {
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(InMemoryTaskStore::new()),
            SchedulerSettings::default(),
        ));
        let tools = ToolRegistry::new();
        tools.add(Arc::new(ScheduleTaskTool::new(scheduler.clone())));

        let calls = (0..6)
            .map(|i| {
                call(
                    &format!("s{i}"),
                    "schedule_task",
                    json!({"task_description": format!("ping {i}"), "delay_minutes": 30}),
                )
            })
            .collect();
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::tool_calls(calls),
            ProviderResponse::text("Scheduled."),
        ]));
        let orch = CompletionOrchestrator::new(
            provider,
            Arc::new(tools),
            PromptBuilder::new("You are {name}.", "murmur"),
            OrchestratorSettings::default(),
        );
        let mut w = window(&["remind me six times"]);

        let outcome = orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        let refused: Vec<Value> = outcome
            .tool_messages
            .iter()
            .map(|m| serde_json::from_str(&m.text()).unwrap())
            .filter(|v: &Value| v.get("error").is_some())
            .collect();
        assert_eq!(refused.len(), 1);
        assert!(refused[0]["error"].as_str().unwrap().contains("at most 5"));
        assert_eq!(scheduler.list_pending(&UserId::from("42")).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn requester_profile_reaches_the_developer_prompt() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        memory
            .update_facts(
                &UserId::from("42"),
                BTreeMap::from([("city".to_string(), "Lyon".to_string())]),
            )
            .await
            .unwrap();
        let provider = Arc::new(ScriptedProvider::replies([ProviderResponse::text("Bonjour")]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default()).with_memory(memory);
        let mut w = window(&["hi"]);

        orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
        let developer = &provider.request(0).messages[0];
        assert!(developer.text().contains("<PROFILE user=Alice id=42 city=Lyon>"));
        assert!(developer.text().starts_with("You are murmur."));
    }

    #[tokio::test]
    async fn isolated_run_merges_only_the_reply() {
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::tool_calls(vec![call("c1", "calculator", json!({"expression": "1+1"}))]),
            ProviderResponse::text("Reminder: stretch!"),
        ]));
        let orch = orchestrator(provider.clone(), OrchestratorSettings::default());
        let mut live = window(&["earlier chat"]);

        let outcome = orch
            .run_isolated(
                &mut live,
                Message::user("[scheduled task] remind Alice to stretch"),
                TaskId(9),
                request(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.tool_messages.len(), 1);
        assert_eq!(roles(&live), vec![Role::User, Role::Assistant]);
        let merged = &live.snapshot()[1];
        assert_eq!(merged.metadata["autonomous_task"], true);
        assert_eq!(merged.metadata["task_id"], 9);
        // the live history was not sent to the model
        assert!(!provider.request(0).messages.iter().any(|m| m.text() == "earlier chat"));
    }

    #[tokio::test]
    async fn concurrent_cycles_on_one_session_run_in_turn() {
        let provider = Arc::new(ScriptedProvider::new([
            Step::EchoAfter(Duration::from_millis(20)),
            Step::EchoAfter(Duration::from_millis(1)),
        ]));
        let orch = Arc::new(orchestrator(provider, OrchestratorSettings::default()));
        let session = Arc::new(Session::new(
            ConversationId::from("general"),
            ContextWindow::new(WindowConfig::default()),
        ));

        let mut handles = Vec::new();
        for text in ["first", "second"] {
            let (orch, session) = (orch.clone(), session.clone());
            handles.push(tokio::spawn(async move {
                let mut w = session.lock().await;
                w.append(Message::user(text));
                orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        let texts: Vec<String> = session.lock().await.snapshot().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["first", "re: first", "second", "re: second"]);
    }

    #[tokio::test]
    async fn tool_runs_are_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let provider = Arc::new(ScriptedProvider::replies([
            ProviderResponse::tool_calls(vec![call("c1", "calculator", json!({"expression": "1/0"}))]),
            ProviderResponse::text("Undefined."),
        ]));
        let orch = orchestrator(provider, OrchestratorSettings::default()).with_events(bus);
        let mut w = window(&["1/0?"]);
        orch.run_cycle(&mut w, request(), &CancellationToken::new()).await.unwrap();

        let event = rx.recv().await.unwrap();
        match &*event {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "calculator");
                assert!(!success);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let event = rx.recv().await.unwrap();
        assert!(matches!(*event, DomainEvent::CompletionFinished { rounds: 1, .. }));
    }
}
