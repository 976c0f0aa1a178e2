//! The agent's turn state machine.
//!
//! The transition function is pure: `(state, context, event)` maps to
//! `(state', context', effects)` with no I/O. Everything the harness does
//! to the outside world is described by the returned effects; the
//! executor in [`crate::fsm::executor`] performs them. This is what makes
//! the FSM replayable and testable without mocks.

pub mod executor;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::model::{AssistantTurn, ToolCallRequest, Usage, WindowMessage};
use crate::store::{Message, MessageSource};

/// How many consecutive stream errors pause the loop.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Operating mode. Truth lives in the store; the FSM context holds a
/// cached copy refreshed by `mode_changed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Conversational,
    Autonomous,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversational => "conversational",
            Self::Autonomous => "autonomous",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conversational" => Some(Self::Conversational),
            "autonomous" => Some(Self::Autonomous),
            _ => None,
        }
    }
}

/// Delay between autonomous turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Seconds(u64),
    Infinite,
}

impl Delay {
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            Self::Seconds(s) => serde_json::json!(s),
            Self::Infinite => serde_json::json!("infinite"),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if s == "infinite" => Some(Self::Infinite),
            serde_json::Value::Number(n) => n.as_u64().map(Self::Seconds),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            Self::Seconds(s) => s.to_string(),
            Self::Infinite => "infinite".to_string(),
        }
    }
}

/// FSM states. There is no terminal state: the machine runs as long as
/// the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Streaming {
        stream_id: u64,
    },
    ExecutingTools {
        calls: Vec<ToolCallRequest>,
        cursor: usize,
    },
    WaitingDelay {
        ms: u64,
    },
    WaitingStep,
}

impl AgentState {
    /// Short tag for observers.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming { .. } => "streaming",
            Self::ExecutingTools { .. } => "executing_tools",
            Self::WaitingDelay { .. } => "waiting_delay",
            Self::WaitingStep => "waiting_step",
        }
    }
}

/// Inputs to the FSM.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    UserMessage { content: String },
    /// `source` is the full validated source, e.g. `external:cron`.
    ExternalMessage { source: String, content: String },
    AutonomousTick,
    StreamStart { stream_id: u64 },
    StreamChunk {
        content: Option<String>,
        reasoning: Option<String>,
    },
    StreamEnd {
        turn: AssistantTurn,
        usage: Option<Usage>,
    },
    StreamError { error: String },
    ToolResult {
        tool_call_id: String,
        result: String,
    },
    ModeChanged { mode: Mode },
    DelayChanged { delay: Delay },
    Step,
    DelayElapsed { generation: u64 },
}

/// Outputs of the FSM, performed by the executor in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Begin a streamed completion over the current window.
    StartStream { stream_id: u64 },
    EmitToken { stream_id: u64, text: String },
    EmitReasoning { stream_id: u64, text: String },
    /// Run one tool call; the result comes back as a `ToolResult` event.
    ExecuteTool { call: ToolCallRequest },
    /// Persist a message to the log.
    SaveMessage {
        source: MessageSource,
        content: String,
        tool_name: Option<String>,
        tool_input: Option<String>,
    },
    /// Broadcast the message persisted by the immediately preceding
    /// `SaveMessage`.
    BroadcastMessage,
    /// Broadcast pressure computed from actual model usage.
    UpdateContextPressure { usage: Usage },
    /// Estimate window pressure, broadcast it, and compact if needed.
    CheckContextPressure,
    ScheduleDelay { ms: u64, generation: u64 },
    WaitForStep,
    LogError { message: String },
    BroadcastFsmState,
}

/// The coordinator-owned context threaded through every transition.
#[derive(Debug, Clone)]
pub struct FsmContext {
    /// The working window sent to the model each turn. Invariant:
    /// `window[0]` is the system prompt; a handoff block, when present,
    /// is `window[1]`.
    pub window: Vec<WindowMessage>,
    pub mode: Mode,
    pub delay: Delay,
    /// User messages deferred while the agent is busy.
    pub queued_user_messages: VecDeque<String>,
    pub consecutive_errors: u32,
    pub turn_number: u64,
    /// Accumulator for the in-flight stream.
    pub current_content: String,
    pub current_reasoning: String,
    /// Generation counter for delay timers; a `DelayElapsed` from an
    /// older generation is stale and ignored.
    pub timer_generation: u64,
    pub system_prompt: String,
    pub autonomous_prompt: String,
    next_stream_id: u64,
}

impl FsmContext {
    pub fn new(
        system_prompt: String,
        autonomous_prompt: String,
        mode: Mode,
        delay: Delay,
        handoff_summary: Option<&str>,
    ) -> Self {
        let mut window = vec![WindowMessage::system(system_prompt.clone())];
        if let Some(summary) = handoff_summary {
            window.push(crate::context::handoff_block(summary));
        }
        Self {
            window,
            mode,
            delay,
            queued_user_messages: VecDeque::new(),
            consecutive_errors: 0,
            turn_number: 0,
            current_content: String::new(),
            current_reasoning: String::new(),
            timer_generation: 0,
            system_prompt,
            autonomous_prompt,
            next_stream_id: 1,
        }
    }

    /// Reset the window to `[system_prompt, handoff]`, used by hard
    /// compaction.
    pub fn reset_window(&mut self, handoff_summary: &str) {
        self.window = vec![
            WindowMessage::system(self.system_prompt.clone()),
            crate::context::handoff_block(handoff_summary),
        ];
    }

    fn alloc_stream_id(&mut self) -> u64 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
    }
}

/// Apply one event. Pure: all consequences are in the returned state,
/// the mutated context, and the effect list.
pub fn transition(
    state: AgentState,
    ctx: &mut FsmContext,
    event: AgentEvent,
) -> (AgentState, Vec<Effect>) {
    let previous_tag = state.tag();
    let (next, mut effects) = dispatch(state, ctx, event);
    if next.tag() != previous_tag {
        effects.push(Effect::BroadcastFsmState);
    }
    (next, effects)
}

fn dispatch(
    state: AgentState,
    ctx: &mut FsmContext,
    event: AgentEvent,
) -> (AgentState, Vec<Effect>) {
    match (state, event) {
        // --- Mode and delay changes apply in any state ---
        (state, AgentEvent::ModeChanged { mode }) => handle_mode_changed(state, ctx, mode),
        (state, AgentEvent::DelayChanged { delay }) => handle_delay_changed(state, ctx, delay),

        // --- Idle ---
        (AgentState::Idle, AgentEvent::UserMessage { content }) => begin_user_turn(ctx, content),
        (AgentState::Idle, AgentEvent::ExternalMessage { source, content }) => {
            begin_external_turn(ctx, &source, &content)
        }
        (AgentState::Idle, AgentEvent::AutonomousTick) => autonomous_tick(ctx),

        // --- Streaming ---
        (state @ AgentState::Streaming { .. }, AgentEvent::StreamStart { .. }) => {
            ctx.current_content.clear();
            ctx.current_reasoning.clear();
            (state, Vec::new())
        }
        (
            AgentState::Streaming { stream_id },
            AgentEvent::StreamChunk { content, reasoning },
        ) => {
            let mut effects = Vec::new();
            if let Some(text) = content {
                ctx.current_content.push_str(&text);
                effects.push(Effect::EmitToken { stream_id, text });
            }
            if let Some(text) = reasoning {
                ctx.current_reasoning.push_str(&text);
                effects.push(Effect::EmitReasoning { stream_id, text });
            }
            (AgentState::Streaming { stream_id }, effects)
        }
        (AgentState::Streaming { .. }, AgentEvent::StreamEnd { turn, usage }) => {
            handle_stream_end(ctx, turn, usage)
        }
        (AgentState::Streaming { .. }, AgentEvent::StreamError { error }) => {
            handle_stream_error(ctx, &error)
        }

        // --- Tool execution ---
        (
            AgentState::ExecutingTools { calls, cursor },
            AgentEvent::ToolResult {
                tool_call_id,
                result,
            },
        ) => {
            ctx.window.push(WindowMessage::tool(tool_call_id, result));
            let next_cursor = cursor + 1;
            if next_cursor < calls.len() {
                let effects = vec![Effect::ExecuteTool {
                    call: calls[next_cursor].clone(),
                }];
                (
                    AgentState::ExecutingTools {
                        calls,
                        cursor: next_cursor,
                    },
                    effects,
                )
            } else {
                // The agent continues its turn after tool responses.
                let stream_id = ctx.alloc_stream_id();
                (
                    AgentState::Streaming { stream_id },
                    vec![
                        Effect::CheckContextPressure,
                        Effect::StartStream { stream_id },
                    ],
                )
            }
        }

        // --- Waiting states ---
        (state @ AgentState::WaitingDelay { .. }, AgentEvent::DelayElapsed { generation }) => {
            if generation == ctx.timer_generation {
                autonomous_tick(ctx)
            } else {
                (state, Vec::new())
            }
        }
        (AgentState::WaitingDelay { .. }, AgentEvent::UserMessage { content }) => {
            // Implicitly cancels the timer.
            ctx.cancel_timer();
            begin_user_turn(ctx, content)
        }
        (AgentState::WaitingDelay { .. }, AgentEvent::ExternalMessage { source, content }) => {
            ctx.cancel_timer();
            begin_external_turn(ctx, &source, &content)
        }
        (AgentState::WaitingStep, AgentEvent::Step) => autonomous_tick(ctx),
        (AgentState::WaitingStep, AgentEvent::UserMessage { content }) => {
            begin_user_turn(ctx, content)
        }
        (AgentState::WaitingStep, AgentEvent::ExternalMessage { source, content }) => {
            begin_external_turn(ctx, &source, &content)
        }

        // --- User input while busy is queued, never dropped ---
        (state, AgentEvent::UserMessage { content }) => {
            ctx.queued_user_messages.push_back(content);
            (state, Vec::new())
        }
        (state, AgentEvent::ExternalMessage { source, content }) => {
            ctx.queued_user_messages
                .push_back(wrap_external(&source, &content));
            (state, Vec::new())
        }

        // Everything else preserves state.
        (state, _) => (state, Vec::new()),
    }
}

fn handle_mode_changed(
    state: AgentState,
    ctx: &mut FsmContext,
    mode: Mode,
) -> (AgentState, Vec<Effect>) {
    ctx.mode = mode;
    match (mode, &state) {
        (Mode::Conversational, AgentState::WaitingDelay { .. })
        | (Mode::Conversational, AgentState::WaitingStep) => {
            ctx.cancel_timer();
            (AgentState::Idle, Vec::new())
        }
        (Mode::Autonomous, AgentState::Idle) => autonomous_tick(ctx),
        _ => (state, Vec::new()),
    }
}

fn handle_delay_changed(
    state: AgentState,
    ctx: &mut FsmContext,
    delay: Delay,
) -> (AgentState, Vec<Effect>) {
    ctx.delay = delay;
    match (&state, delay) {
        (AgentState::WaitingStep, Delay::Seconds(secs)) => {
            ctx.cancel_timer();
            let ms = secs * 1000;
            let generation = ctx.timer_generation;
            (
                AgentState::WaitingDelay { ms },
                vec![Effect::ScheduleDelay { ms, generation }],
            )
        }
        _ => (state, Vec::new()),
    }
}

fn wrap_external(source: &str, content: &str) -> String {
    let name = source.strip_prefix("external:").unwrap_or(source);
    format!("[External message from {name}]\n{content}")
}

/// Start a turn for a user message: persist, broadcast, check pressure,
/// stream.
fn begin_user_turn(ctx: &mut FsmContext, content: String) -> (AgentState, Vec<Effect>) {
    ctx.consecutive_errors = 0;
    ctx.turn_number += 1;
    ctx.window.push(WindowMessage::user(content.clone()));

    let stream_id = ctx.alloc_stream_id();
    (
        AgentState::Streaming { stream_id },
        vec![
            Effect::SaveMessage {
                source: MessageSource::User,
                content,
                tool_name: None,
                tool_input: None,
            },
            Effect::BroadcastMessage,
            Effect::CheckContextPressure,
            Effect::StartStream { stream_id },
        ],
    )
}

/// Start a turn for an injected external message. The gateway already
/// persisted and broadcast the record; the FSM only wraps it into the
/// window.
fn begin_external_turn(
    ctx: &mut FsmContext,
    source: &str,
    content: &str,
) -> (AgentState, Vec<Effect>) {
    ctx.consecutive_errors = 0;
    ctx.turn_number += 1;
    ctx.window
        .push(WindowMessage::user(wrap_external(source, content)));

    let stream_id = ctx.alloc_stream_id();
    (
        AgentState::Streaming { stream_id },
        vec![
            Effect::CheckContextPressure,
            Effect::StartStream { stream_id },
        ],
    )
}

/// One autonomous tick: drain the queue first, otherwise nudge.
fn autonomous_tick(ctx: &mut FsmContext) -> (AgentState, Vec<Effect>) {
    if let Some(queued) = ctx.queued_user_messages.pop_front() {
        return begin_user_turn(ctx, queued);
    }
    if ctx.mode != Mode::Autonomous {
        return (AgentState::Idle, Vec::new());
    }

    ctx.turn_number += 1;
    // The nudge steers the model but is not conversation; it stays out of
    // the durable log.
    ctx.window
        .push(WindowMessage::user(ctx.autonomous_prompt.clone()));

    let stream_id = ctx.alloc_stream_id();
    (
        AgentState::Streaming { stream_id },
        vec![
            Effect::CheckContextPressure,
            Effect::StartStream { stream_id },
        ],
    )
}

fn handle_stream_end(
    ctx: &mut FsmContext,
    turn: AssistantTurn,
    usage: Option<Usage>,
) -> (AgentState, Vec<Effect>) {
    let mut effects = Vec::new();

    ctx.current_content.clear();
    ctx.current_reasoning.clear();
    ctx.consecutive_errors = 0;

    if !turn.reasoning.is_empty() {
        effects.push(Effect::SaveMessage {
            source: MessageSource::Reasoning,
            content: turn.reasoning.clone(),
            tool_name: None,
            tool_input: None,
        });
        effects.push(Effect::BroadcastMessage);
    }
    if !turn.content.is_empty() {
        effects.push(Effect::SaveMessage {
            source: MessageSource::Assistant,
            content: turn.content.clone(),
            tool_name: None,
            tool_input: None,
        });
        effects.push(Effect::BroadcastMessage);
    }

    if !turn.content.is_empty() || !turn.tool_calls.is_empty() {
        ctx.window.push(WindowMessage::assistant_with_tool_calls(
            turn.content.clone(),
            turn.tool_calls.clone(),
        ));
    }

    if let Some(usage) = usage {
        effects.push(Effect::UpdateContextPressure { usage });
    }

    if !turn.tool_calls.is_empty() {
        effects.push(Effect::ExecuteTool {
            call: turn.tool_calls[0].clone(),
        });
        return (
            AgentState::ExecutingTools {
                calls: turn.tool_calls,
                cursor: 0,
            },
            effects,
        );
    }

    let (state, routing_effects) = post_turn(ctx);
    effects.extend(routing_effects);
    (state, effects)
}

fn handle_stream_error(ctx: &mut FsmContext, error: &str) -> (AgentState, Vec<Effect>) {
    ctx.consecutive_errors += 1;
    ctx.current_content.clear();
    ctx.current_reasoning.clear();

    let mut effects = vec![
        Effect::LogError {
            message: format!("stream error ({}/{MAX_CONSECUTIVE_ERRORS}): {error}", ctx.consecutive_errors),
        },
        Effect::SaveMessage {
            source: MessageSource::System,
            content: format!("Stream error: {error}"),
            tool_name: None,
            tool_input: None,
        },
        Effect::BroadcastMessage,
    ];

    if ctx.consecutive_errors < MAX_CONSECUTIVE_ERRORS {
        // Retry with a recovery prompt in the window (steering only, not
        // persisted).
        ctx.window.push(WindowMessage::user(format!(
            "[System: The previous response caused an error: \"{error}\". Please adjust and try again.]"
        )));
        let stream_id = ctx.alloc_stream_id();
        effects.push(Effect::StartStream { stream_id });
        (AgentState::Streaming { stream_id }, effects)
    } else {
        effects.push(Effect::SaveMessage {
            source: MessageSource::System,
            content: format!(
                "Agent paused after {MAX_CONSECUTIVE_ERRORS} consecutive stream errors. \
                 Waiting for input."
            ),
            tool_name: None,
            tool_input: None,
        });
        effects.push(Effect::BroadcastMessage);
        ctx.consecutive_errors = 0;
        (AgentState::Idle, effects)
    }
}

/// Routing after a turn ends without tool calls.
fn post_turn(ctx: &mut FsmContext) -> (AgentState, Vec<Effect>) {
    if let Some(queued) = ctx.queued_user_messages.pop_front() {
        return begin_user_turn(ctx, queued);
    }
    if ctx.mode == Mode::Conversational {
        return (AgentState::Idle, Vec::new());
    }
    match ctx.delay {
        Delay::Infinite => (AgentState::WaitingStep, vec![Effect::WaitForStep]),
        Delay::Seconds(secs) if secs > 0 => {
            ctx.cancel_timer();
            let ms = secs * 1000;
            let generation = ctx.timer_generation;
            (
                AgentState::WaitingDelay { ms },
                vec![Effect::ScheduleDelay { ms, generation }],
            )
        }
        Delay::Seconds(_) => autonomous_tick(ctx),
    }
}

/// Rebuild a working window from the durable log, pairing tool-call
/// records with their results by position. Used at bootstrap to restore
/// the conversation horizon of the current session.
pub fn window_from_log(
    system_prompt: &str,
    handoff_summary: Option<&str>,
    log: &[Message],
) -> Vec<WindowMessage> {
    let mut window = vec![WindowMessage::system(system_prompt)];
    if let Some(summary) = handoff_summary {
        window.push(crate::context::handoff_block(summary));
    }

    for message in log {
        match &message.source {
            MessageSource::User => window.push(WindowMessage::user(message.content.clone())),
            MessageSource::External(source) => {
                window.push(WindowMessage::user(wrap_external(source, &message.content)));
            }
            MessageSource::Assistant => {
                window.push(WindowMessage::assistant(message.content.clone()));
            }
            MessageSource::ToolCall => {
                // Attach the call to the preceding assistant message,
                // creating an empty one when the turn was tool-only.
                let call = ToolCallRequest {
                    id: String::new(),
                    name: message.tool_name.clone().unwrap_or_default(),
                    arguments: message.tool_input.clone().unwrap_or_else(|| "{}".into()),
                };
                match window.last_mut() {
                    Some(last) if last.role == crate::model::Role::Assistant => {
                        last.tool_calls.push(call);
                    }
                    _ => window.push(WindowMessage::assistant_with_tool_calls("", vec![call])),
                }
            }
            MessageSource::ToolResult => {
                // The call id was recorded as the result's tool_name.
                let call_id = message.tool_name.clone().unwrap_or_default();
                backfill_call_id(&mut window, &call_id);
                window.push(WindowMessage::tool(call_id, message.content.clone()));
            }
            // Reasoning and system records are log-only.
            MessageSource::Reasoning | MessageSource::System => {}
        }
    }
    window
}

/// Give the oldest id-less pending tool call its id, once the matching
/// result shows up in the log.
fn backfill_call_id(window: &mut [WindowMessage], call_id: &str) {
    for message in window.iter_mut().rev() {
        if message.role == crate::model::Role::Assistant {
            if let Some(call) = message.tool_calls.iter_mut().find(|c| c.id.is_empty()) {
                call.id = call_id.to_string();
            }
            return;
        }
    }
}
