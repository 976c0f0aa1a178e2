//! The coordinator that drives the FSM.
//!
//! One tokio task owns the FSM state and context; every transition is
//! serialised through its event queue. Effects are executed sequentially
//! for one transition before the next event is dequeued. I/O launched by
//! effects (model streaming, tool execution, timers) runs in spawned
//! tasks whose only interaction with FSM state is posting further events
//! onto the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::broadcast::{EventHub, HubEvent};
use crate::context::{self, ContextManager, Pressure, PressureLevel};
use crate::error::StoreError;
use crate::fsm::{transition, AgentEvent, AgentState, Effect, FsmContext};
use crate::model::{ChatRequest, ModelClient, StreamDelta, ToolCallRequest};
use crate::store::{Message, MessageSource, Store};
use crate::tools::{InterruptFlag, ToolContext, ToolRegistry};

/// Queue depth for coordinator messages.
const QUEUE_CAPACITY: usize = 256;

/// Budget between the context warning and the session handoff.
const COMPACTION_GRACE: Duration = Duration::from_secs(5);

/// Messages accepted by the coordinator.
#[derive(Debug)]
pub enum CoordinatorMsg {
    Event(AgentEvent),
    /// The compaction grace period expired.
    CompactDeadline,
}

/// Cheap cloneable handle for feeding events to the coordinator.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<CoordinatorMsg>,
    interrupt: InterruptFlag,
}

impl AgentHandle {
    /// Post an event. User messages also raise the interrupt probe so
    /// in-flight tools can yield promptly.
    pub async fn send(&self, event: AgentEvent) {
        if matches!(event, AgentEvent::UserMessage { .. }) {
            self.interrupt.raise();
        }
        if self.tx.send(CoordinatorMsg::Event(event)).await.is_err() {
            tracing::warn!("coordinator is gone; dropping event");
        }
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }
}

/// The effect executor and sole owner of the FSM context.
pub struct Coordinator {
    state: AgentState,
    ctx: FsmContext,
    rx: mpsc::Receiver<CoordinatorMsg>,
    tx: mpsc::Sender<CoordinatorMsg>,
    store: Arc<Store>,
    hub: EventHub,
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    tool_ctx: ToolContext,
    context_manager: ContextManager,
    interrupt: InterruptFlag,
    /// The record persisted by the most recent `SaveMessage`, broadcast
    /// by the `BroadcastMessage` that always follows it.
    last_saved: Option<Message>,
    /// Set once the context warning has been issued; cleared after the
    /// handoff completes.
    compaction_warned: bool,
    compaction_grace: Duration,
}

impl Coordinator {
    pub fn new(
        ctx: FsmContext,
        store: Arc<Store>,
        hub: EventHub,
        model: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        context_manager: ContextManager,
        workspace: PathBuf,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let interrupt = InterruptFlag::new();
        let tool_ctx = ToolContext::new(
            workspace,
            Arc::clone(&store),
            hub.clone(),
            interrupt.clone(),
        );
        let handle = AgentHandle {
            tx: tx.clone(),
            interrupt: interrupt.clone(),
        };
        let coordinator = Self {
            state: AgentState::Idle,
            ctx,
            rx,
            tx,
            store,
            hub,
            model,
            registry,
            tool_ctx,
            context_manager,
            interrupt,
            last_saved: None,
            compaction_warned: false,
            compaction_grace: COMPACTION_GRACE,
        };
        (coordinator, handle)
    }

    /// Shorten the compaction grace period (used by tests).
    pub fn with_compaction_grace(mut self, grace: Duration) -> Self {
        self.compaction_grace = grace;
        self
    }

    /// Drive the loop until the process ends. Only a store failure stops
    /// it: without durable state there is no meaningful recovery.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            let result = match msg {
                CoordinatorMsg::Event(event) => self.handle_event(event).await,
                CoordinatorMsg::CompactDeadline => self.handle_compact_deadline(),
            };
            if let Err(e) = result {
                tracing::error!("fatal store error, stopping coordinator: {e}");
                return;
            }
        }
    }

    async fn handle_event(&mut self, event: AgentEvent) -> Result<(), StoreError> {
        let state = std::mem::replace(&mut self.state, AgentState::Idle);
        let (next, effects) = transition(state, &mut self.ctx, event);
        self.state = next;

        for effect in effects {
            self.execute_effect(effect).await?;
        }

        // The probe stays raised exactly while user input is still
        // pending consumption.
        if self.ctx.queued_user_messages.is_empty() {
            self.interrupt.clear();
        } else {
            self.interrupt.raise();
        }
        Ok(())
    }

    async fn execute_effect(&mut self, effect: Effect) -> Result<(), StoreError> {
        match effect {
            Effect::StartStream { stream_id } => self.start_stream(stream_id),
            Effect::EmitToken { stream_id, text } => {
                self.hub.publish(HubEvent::Token { stream_id, text });
            }
            Effect::EmitReasoning { stream_id, text } => {
                self.hub.publish(HubEvent::Reasoning { stream_id, text });
            }
            Effect::ExecuteTool { call } => self.execute_tool(call)?,
            Effect::SaveMessage {
                source,
                content,
                tool_name,
                tool_input,
            } => {
                let message = self.store.append_message(
                    &source,
                    &content,
                    tool_name.as_deref(),
                    tool_input.as_deref(),
                    None,
                )?;
                self.last_saved = Some(message);
            }
            Effect::BroadcastMessage => {
                if let Some(message) = self.last_saved.clone() {
                    self.hub.publish(HubEvent::Message(message));
                }
            }
            Effect::UpdateContextPressure { usage } => {
                // Actual usage from the model supersedes the estimate.
                let pressure = self
                    .context_manager
                    .pressure_from_tokens(usage.prompt_tokens as usize);
                self.publish_pressure(&pressure);
            }
            Effect::CheckContextPressure => self.check_context_pressure()?,
            Effect::ScheduleDelay { ms, generation } => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = tx
                        .send(CoordinatorMsg::Event(AgentEvent::DelayElapsed { generation }))
                        .await;
                });
            }
            Effect::WaitForStep => {
                // The waiting_step state itself is the wait.
            }
            Effect::LogError { message } => {
                tracing::error!("{message}");
            }
            Effect::BroadcastFsmState => {
                self.hub.publish(HubEvent::FsmState {
                    state: self.state.tag().to_string(),
                    turn_number: self.ctx.turn_number,
                });
            }
        }
        Ok(())
    }

    /// Spawn a streamed completion over a snapshot of the current window.
    /// Chunk events for a stream always precede its end event: the delta
    /// forwarder is drained before the terminal event is posted.
    fn start_stream(&self, stream_id: u64) {
        let request = ChatRequest {
            messages: self.ctx.window.clone(),
            tools: self.registry.definitions(),
        };
        let model = Arc::clone(&self.model);
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let _ = tx
                .send(CoordinatorMsg::Event(AgentEvent::StreamStart { stream_id }))
                .await;

            let (delta_tx, mut delta_rx) = mpsc::channel::<StreamDelta>(64);
            let forwarder = {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(delta) = delta_rx.recv().await {
                        let event = match delta {
                            StreamDelta::Content(text) => AgentEvent::StreamChunk {
                                content: Some(text),
                                reasoning: None,
                            },
                            StreamDelta::Reasoning(text) => AgentEvent::StreamChunk {
                                content: None,
                                reasoning: Some(text),
                            },
                        };
                        if tx.send(CoordinatorMsg::Event(event)).await.is_err() {
                            break;
                        }
                    }
                })
            };

            let outcome = model.stream_chat(request, delta_tx).await;
            // The delta sender is dropped; let the forwarder drain fully
            // so chunks precede the terminal event.
            let _ = forwarder.await;

            let terminal = match outcome {
                Ok((turn, usage)) => AgentEvent::StreamEnd { turn, usage },
                Err(e) => AgentEvent::StreamError {
                    error: e.to_string(),
                },
            };
            let _ = tx.send(CoordinatorMsg::Event(terminal)).await;
        });
    }

    /// Run one tool call: persist and broadcast the `tool_call` record,
    /// dispatch in a spawned task, persist and broadcast the
    /// `tool_result`, then feed the result back as an event. Calls are
    /// strictly sequential: the FSM emits the next `ExecuteTool` only
    /// after this result arrives.
    fn execute_tool(&mut self, call: ToolCallRequest) -> Result<(), StoreError> {
        let record = self.store.append_message(
            &MessageSource::ToolCall,
            &format!("Calling {}", call.name),
            Some(&call.name),
            Some(&call.arguments),
            None,
        )?;
        self.hub.publish(HubEvent::Message(record));

        let registry = Arc::clone(&self.registry);
        let tool_ctx = self.tool_ctx.clone();
        let store = Arc::clone(&self.store);
        let hub = self.hub.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = registry.dispatch(&call.name, &call.arguments, &tool_ctx).await;

            // The call id goes into tool_name: it is the correlation key
            // used when rebuilding the working window.
            match store.append_message(&MessageSource::ToolResult, &result, Some(&call.id), None, None)
            {
                Ok(record) => hub.publish(HubEvent::Message(record)),
                Err(e) => tracing::error!("failed to persist tool result: {e}"),
            }

            let _ = tx
                .send(CoordinatorMsg::Event(AgentEvent::ToolResult {
                    tool_call_id: call.id,
                    result,
                }))
                .await;
        });
        Ok(())
    }

    fn publish_pressure(&self, pressure: &Pressure) {
        self.hub.publish(HubEvent::ContextPressure {
            tokens: pressure.tokens,
            max: pressure.max,
            ratio: pressure.ratio,
            level: pressure.level.as_str().to_string(),
        });
    }

    /// Estimate pressure, broadcast it, and react: soft pressure compacts
    /// in place, hard pressure starts the warning-then-handoff sequence.
    fn check_context_pressure(&mut self) -> Result<(), StoreError> {
        let pressure = self.context_manager.measure(&self.ctx.window);
        self.publish_pressure(&pressure);

        match pressure.level {
            PressureLevel::Normal => {}
            PressureLevel::Soft => {
                context::soft_compact(&mut self.ctx.window);
            }
            PressureLevel::Hard | PressureLevel::Overflow => {
                self.begin_hard_compaction()?;
            }
        }
        Ok(())
    }

    /// Issue the one-time warning and arm the handoff deadline. The grace
    /// period gives the agent a chance to persist state with its own
    /// tools.
    fn begin_hard_compaction(&mut self) -> Result<(), StoreError> {
        if self.compaction_warned {
            return Ok(());
        }
        self.compaction_warned = true;

        let warning = "[Context warning: the window is nearly full. Persist anything \
                       important with your tools now; a session handoff is imminent.]";
        let record =
            self.store
                .append_message(&MessageSource::System, warning, None, None, None)?;
        self.hub.publish(HubEvent::Message(record));
        self.ctx.window.push(crate::model::WindowMessage::system(warning));

        let tx = self.tx.clone();
        let grace = self.compaction_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(CoordinatorMsg::CompactDeadline).await;
        });
        Ok(())
    }

    /// The grace period expired: perform the session handoff if pressure
    /// is still hard. Compaction failures are logged, never fatal; the
    /// warning stays in place.
    fn handle_compact_deadline(&mut self) -> Result<(), StoreError> {
        let pressure = self.context_manager.measure(&self.ctx.window);
        if pressure.level < PressureLevel::Hard {
            self.compaction_warned = false;
            return Ok(());
        }

        match self.perform_handoff() {
            Ok(()) => {
                self.compaction_warned = false;
            }
            Err(e) => {
                tracing::error!("session handoff failed, continuing under pressure: {e}");
            }
        }
        Ok(())
    }

    fn perform_handoff(&mut self) -> Result<(), StoreError> {
        let summary = context::handoff_summary(&self.ctx.window);

        self.store.end_current_session()?;
        let session = self.store.start_session(Some(&summary))?;
        self.ctx.reset_window(&summary);

        let divider = format!("--- Session {} started after context handoff ---", session.id);
        let record =
            self.store
                .append_message(&MessageSource::System, &divider, None, None, None)?;
        self.hub.publish(HubEvent::Message(record));

        let pressure = self.context_manager.measure(&self.ctx.window);
        self.publish_pressure(&pressure);

        tracing::info!(session = session.id, "session handoff complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::fsm::{Delay, Mode};
    use crate::model::{AssistantTurn, Usage};
    use crate::store::TaskStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A scripted stand-in for the model endpoint.
    enum Scripted {
        Text(&'static str),
        Tool(ToolCallRequest),
        Fail(&'static str),
    }

    struct ScriptedModel {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> Option<ChatRequest> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn stream_chat(
            &self,
            request: ChatRequest,
            deltas: mpsc::Sender<StreamDelta>,
        ) -> Result<(AssistantTurn, Option<Usage>), ModelError> {
            self.requests.lock().unwrap().push(request);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Scripted::Text(text)) => {
                    // Stream character by character like a real endpoint.
                    for c in text.chars() {
                        let _ = deltas.send(StreamDelta::Content(c.to_string())).await;
                    }
                    Ok((
                        AssistantTurn {
                            content: text.to_string(),
                            reasoning: String::new(),
                            tool_calls: Vec::new(),
                        },
                        Some(Usage {
                            prompt_tokens: 10,
                            completion_tokens: 5,
                            total_tokens: 15,
                        }),
                    ))
                }
                Some(Scripted::Tool(call)) => Ok((
                    AssistantTurn {
                        content: String::new(),
                        reasoning: String::new(),
                        tool_calls: vec![call],
                    },
                    None,
                )),
                Some(Scripted::Fail(error)) => Err(ModelError::InvalidStream(error.to_string())),
                None => Ok((AssistantTurn::default(), None)),
            }
        }
    }

    struct Fixture {
        handle: AgentHandle,
        hub: EventHub,
        store: Arc<Store>,
        model: Arc<ScriptedModel>,
        coordinator_task: tokio::task::JoinHandle<()>,
        _workspace: tempfile::TempDir,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.coordinator_task.abort();
        }
    }

    fn fixture(mode: Mode, delay: Delay, script: Vec<Scripted>) -> Fixture {
        fixture_with_context_size(mode, delay, script, 32_768, COMPACTION_GRACE)
    }

    fn fixture_with_context_size(
        mode: Mode,
        delay: Delay,
        script: Vec<Scripted>,
        context_size: usize,
        grace: Duration,
    ) -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_open_session().unwrap();
        let hub = EventHub::new();
        let model = ScriptedModel::new(script);
        let registry = Arc::new(crate::tools::builtin_registry(&crate::config::Config::default()));
        let ctx = FsmContext::new("test system prompt".into(), "tick nudge".into(), mode, delay, None);

        let (coordinator, handle) = Coordinator::new(
            ctx,
            Arc::clone(&store),
            hub.clone(),
            model.clone() as Arc<dyn ModelClient>,
            registry,
            ContextManager::new(context_size),
            workspace.path().to_path_buf(),
        );
        let coordinator = coordinator.with_compaction_grace(grace);
        let coordinator_task = tokio::spawn(coordinator.run());

        Fixture {
            handle,
            hub,
            store,
            model,
            coordinator_task,
            _workspace: workspace,
        }
    }

    /// Collect hub events until `pred` matches one or the timeout lapses.
    async fn collect_until(
        observer: &mut crate::broadcast::Observer,
        pred: impl Fn(&HubEvent) -> bool,
    ) -> Vec<HubEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, observer.recv()).await {
                Ok(Some(event)) => {
                    let done = pred(&event);
                    events.push(event);
                    if done {
                        return events;
                    }
                }
                _ => return events,
            }
        }
    }

    fn is_fsm_state(event: &HubEvent, tag: &str) -> bool {
        matches!(event, HubEvent::FsmState { state, .. } if state == tag)
    }

    // S1: conversational greeting.
    #[tokio::test]
    async fn test_conversational_greeting() {
        let f = fixture(
            Mode::Conversational,
            Delay::Seconds(5),
            vec![Scripted::Text("hello")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle
            .send(AgentEvent::UserMessage { content: "hi".into() })
            .await;

        let events = collect_until(&mut observer, |e| is_fsm_state(e, "idle")).await;

        // User record first, then streamed tokens summing to the reply,
        // then the assistant record.
        let user_pos = events
            .iter()
            .position(|e| matches!(e, HubEvent::Message(m) if m.source == MessageSource::User))
            .expect("user message broadcast");
        let token_text: String = events
            .iter()
            .filter_map(|e| match e {
                HubEvent::Token { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(token_text, "hello");
        let assistant_pos = events
            .iter()
            .position(
                |e| matches!(e, HubEvent::Message(m) if m.source == MessageSource::Assistant),
            )
            .expect("assistant message broadcast");
        assert!(user_pos < assistant_pos);

        // FSM went streaming then back to idle.
        assert!(events.iter().any(|e| is_fsm_state(e, "streaming")));
        assert!(events.iter().any(|e| is_fsm_state(e, "idle")));

        // The log holds exactly the user and assistant records.
        let log = f.store.list_messages().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].source, MessageSource::User);
        assert_eq!(log[0].content, "hi");
        assert_eq!(log[1].source, MessageSource::Assistant);
        assert_eq!(log[1].content, "hello");
    }

    // S2: autonomous tick with tool use, ending in waiting_delay.
    #[tokio::test]
    async fn test_autonomous_tick_with_tool_use() {
        let f = fixture(
            Mode::Autonomous,
            Delay::Seconds(5),
            vec![
                Scripted::Tool(ToolCallRequest {
                    id: "call_1".into(),
                    name: "filesystem".into(),
                    arguments: r#"{"operation":"list","path":"."}"#.into(),
                }),
                Scripted::Text("the workspace is empty"),
            ],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle.send(AgentEvent::AutonomousTick).await;

        let events = collect_until(&mut observer, |e| is_fsm_state(e, "waiting_delay")).await;

        let sources: Vec<MessageSource> = events
            .iter()
            .filter_map(|e| match e {
                HubEvent::Message(m) => Some(m.source.clone()),
                _ => None,
            })
            .collect();
        let call_pos = sources
            .iter()
            .position(|s| *s == MessageSource::ToolCall)
            .expect("tool_call broadcast");
        let result_pos = sources
            .iter()
            .position(|s| *s == MessageSource::ToolResult)
            .expect("tool_result broadcast");
        let assistant_pos = sources
            .iter()
            .position(|s| *s == MessageSource::Assistant)
            .expect("assistant follow-up broadcast");
        assert!(call_pos < result_pos);
        assert!(result_pos < assistant_pos);

        // The log recorded the call with its input and the result keyed
        // by call id.
        let log = f.store.list_messages().unwrap();
        let call = log
            .iter()
            .find(|m| m.source == MessageSource::ToolCall)
            .unwrap();
        assert_eq!(call.tool_name.as_deref(), Some("filesystem"));
        assert_eq!(call.content, "Calling filesystem");
        let result = log
            .iter()
            .find(|m| m.source == MessageSource::ToolResult)
            .unwrap();
        assert_eq!(result.tool_name.as_deref(), Some("call_1"));
    }

    // S3: a user message pre-empts the autonomous delay.
    #[tokio::test]
    async fn test_user_preempts_delay() {
        let f = fixture(
            Mode::Autonomous,
            Delay::Seconds(5),
            vec![Scripted::Text("first"), Scripted::Text("stopping now")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle.send(AgentEvent::AutonomousTick).await;
        collect_until(&mut observer, |e| is_fsm_state(e, "waiting_delay")).await;

        let start = tokio::time::Instant::now();
        f.handle
            .send(AgentEvent::UserMessage { content: "stop".into() })
            .await;
        let events = collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m) if m.content == "stopping now")
        })
        .await;

        // The "stop" turn ran well before the 5s delay would have fired.
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(events.iter().any(|e| is_fsm_state(e, "streaming")));
        let log = f.store.list_messages().unwrap();
        assert!(log.iter().any(|m| m.content == "stop"));
    }

    // S4: hard compaction performs a session handoff.
    #[tokio::test]
    async fn test_hard_compaction_session_handoff() {
        // Tiny context: the first turn immediately exceeds the hard
        // threshold. Short grace keeps the test quick.
        let f = fixture_with_context_size(
            Mode::Conversational,
            Delay::Seconds(5),
            vec![Scripted::Text("ack")],
            40,
            Duration::from_millis(200),
        );
        let mut observer = f.hub.subscribe().unwrap();
        let first_session = f.store.current_session().unwrap().unwrap();

        f.handle
            .send(AgentEvent::UserMessage {
                content: "a".repeat(400),
            })
            .await;

        let events = collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m)
                if m.source == MessageSource::System && m.content.contains("Session"))
        })
        .await;

        // Warning first, divider after the grace period.
        assert!(events.iter().any(|e| matches!(
            e,
            HubEvent::Message(m)
                if m.source == MessageSource::System && m.content.contains("Context warning")
        )));

        let session = f.store.current_session().unwrap().unwrap();
        assert_ne!(session.id, first_session.id);
        assert!(session.handoff_summary.is_some());

        let log = f.store.list_messages().unwrap();
        let divider = log
            .iter()
            .find(|m| m.content.contains("context handoff"))
            .expect("divider persisted");
        assert!(divider.content.contains(&session.id.to_string()));
    }

    // S5: a timed terminal command is backgrounded and later completes.
    #[tokio::test]
    async fn test_backgrounded_shell_command() {
        let workspace = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = crate::tools::builtin_registry(&crate::config::Config::default());
        let ctx = ToolContext::new(
            workspace.path().to_path_buf(),
            Arc::clone(&store),
            EventHub::new(),
            InterruptFlag::new(),
        );

        let start = tokio::time::Instant::now();
        let result = registry
            .dispatch(
                "terminal",
                r#"{"command": "sleep 0.4 && echo done", "timeout": 60}"#,
                &ctx,
            )
            .await;
        assert!(start.elapsed() < Duration::from_millis(350));

        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["message"], "Timeout exceeded, backgrounded");
        let task_id = parsed["task_id"].as_str().unwrap().to_string();

        let task = store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let task = store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.as_deref().unwrap().contains("done"));
    }

    // S6: external injection reaches the model wrapped.
    #[tokio::test]
    async fn test_external_injection() {
        let f = fixture(
            Mode::Conversational,
            Delay::Seconds(5),
            vec![Scripted::Text("noted")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle
            .send(AgentEvent::ExternalMessage {
                source: "external:cron".into(),
                content: "tick".into(),
            })
            .await;

        collect_until(&mut observer, |e| is_fsm_state(e, "idle")).await;

        let request = f.model.last_request().expect("model was called");
        let wrapped = request
            .messages
            .iter()
            .find(|m| m.content == "[External message from cron]\ntick")
            .expect("wrapped external message in window");
        assert_eq!(wrapped.role, crate::model::Role::User);
    }

    // Property 10 at the executor level: three failures pause the loop.
    #[tokio::test]
    async fn test_retry_ladder_pauses_after_three_errors() {
        let f = fixture(
            Mode::Conversational,
            Delay::Seconds(5),
            vec![
                Scripted::Fail("boom 1"),
                Scripted::Fail("boom 2"),
                Scripted::Fail("boom 3"),
            ],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle
            .send(AgentEvent::UserMessage { content: "try".into() })
            .await;

        let events = collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m) if m.content.contains("paused"))
        })
        .await;
        assert!(events.iter().any(
            |e| matches!(e, HubEvent::Message(m) if m.content.contains("paused")),
        ));

        // Three error records plus the pause notice, and the model was
        // tried exactly three times (one initial + two retries).
        let log = f.store.list_messages().unwrap();
        let errors = log
            .iter()
            .filter(|m| m.content.starts_with("Stream error:"))
            .count();
        assert_eq!(errors, 3);
        assert_eq!(f.model.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_error_then_recovery() {
        let f = fixture(
            Mode::Conversational,
            Delay::Seconds(5),
            vec![Scripted::Fail("hiccup"), Scripted::Text("recovered")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle
            .send(AgentEvent::UserMessage { content: "go".into() })
            .await;

        collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m) if m.content == "recovered")
        })
        .await;

        // The retry carried a recovery prompt to the model.
        let request = f.model.last_request().unwrap();
        assert!(request
            .messages
            .iter()
            .any(|m| m.content.contains("previous response caused an error")));
    }

    // Property 9: interrupt liveness through the executor.
    #[tokio::test]
    async fn test_sleep_tool_interrupted_by_user_message() {
        let f = fixture(
            Mode::Autonomous,
            Delay::Seconds(60),
            vec![
                Scripted::Tool(ToolCallRequest {
                    id: "call_sleep".into(),
                    name: "sleep".into(),
                    arguments: r#"{"duration_ms": 20000}"#.into(),
                }),
                Scripted::Text("woke up early"),
                Scripted::Text("answering you"),
            ],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle.send(AgentEvent::AutonomousTick).await;

        // Wait until the sleep tool is running.
        collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m) if m.source == MessageSource::ToolCall)
        })
        .await;

        let start = tokio::time::Instant::now();
        f.handle
            .send(AgentEvent::UserMessage {
                content: "wake up".into(),
            })
            .await;

        let events = collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m) if m.content == "answering you")
        })
        .await;

        // The 20s sleep yielded within probe latency and the queued user
        // message was processed before any autonomous tick.
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.iter().any(|e| matches!(
            e,
            HubEvent::Message(m)
                if m.source == MessageSource::ToolResult && m.content.contains("interrupted")
        )));
        let log = f.store.list_messages().unwrap();
        assert!(log.iter().any(|m| m.content == "wake up"));
    }

    #[tokio::test]
    async fn test_autonomous_loop_reschedules() {
        let f = fixture(
            Mode::Autonomous,
            Delay::Seconds(1),
            vec![Scripted::Text("turn one"), Scripted::Text("turn two")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle.send(AgentEvent::AutonomousTick).await;

        // After the first turn the delay elapses and a second autonomous
        // turn runs on its own.
        let events = collect_until(&mut observer, |e| {
            matches!(e, HubEvent::Message(m) if m.content == "turn two")
        })
        .await;
        assert!(events.iter().any(
            |e| matches!(e, HubEvent::Message(m) if m.content == "turn one"),
        ));
    }

    #[tokio::test]
    async fn test_step_mode() {
        let f = fixture(
            Mode::Autonomous,
            Delay::Infinite,
            vec![Scripted::Text("stepped once"), Scripted::Text("stepped twice")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle.send(AgentEvent::AutonomousTick).await;
        let events = collect_until(&mut observer, |e| is_fsm_state(e, "waiting_step")).await;
        assert!(events.iter().any(
            |e| matches!(e, HubEvent::Message(m) if m.content == "stepped once"),
        ));

        // No further turn until a step arrives.
        f.handle.send(AgentEvent::Step).await;
        let events = collect_until(&mut observer, |e| is_fsm_state(e, "waiting_step")).await;
        assert!(events.iter().any(
            |e| matches!(e, HubEvent::Message(m) if m.content == "stepped twice"),
        ));
    }

    #[tokio::test]
    async fn test_usage_supersedes_estimate_in_broadcast() {
        let f = fixture(
            Mode::Conversational,
            Delay::Seconds(5),
            vec![Scripted::Text("hi")],
        );
        let mut observer = f.hub.subscribe().unwrap();

        f.handle
            .send(AgentEvent::UserMessage { content: "hello".into() })
            .await;

        let events = collect_until(&mut observer, |e| is_fsm_state(e, "idle")).await;
        // The scripted model reports 10 prompt tokens; the final pressure
        // broadcast carries exactly that.
        let last_pressure = events
            .iter()
            .rev()
            .find_map(|e| match e {
                HubEvent::ContextPressure { tokens, .. } => Some(*tokens),
                _ => None,
            })
            .expect("pressure broadcast");
        assert_eq!(last_pressure, 10);
    }
}
