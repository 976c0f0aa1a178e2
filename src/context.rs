//! Context window accounting and compaction.
//!
//! Token estimation is deliberately approximate (four characters per
//! token); when the model reports actual prompt usage that value wins for
//! pressure broadcasts. Soft compaction trims old tool output in place;
//! hard compaction is a session handoff driven by the executor.

use crate::model::{Role, WindowMessage};

/// Per-message fixed overhead, in estimated tokens.
const MESSAGE_OVERHEAD: usize = 4;

/// Messages at the tail of the window that soft compaction never touches.
const KEEP_RECENT: usize = 10;

/// Tool results longer than this are summarised by soft compaction.
const TOOL_SUMMARY_THRESHOLD: usize = 500;

/// Characters of the original kept in a summarised tool result.
const SUMMARY_PREVIEW_CHARS: usize = 200;

/// Pressure classification against the configured context size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Soft,
    Hard,
    Overflow,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Overflow => "overflow",
        }
    }

    /// Classify a usage ratio.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.10 {
            Self::Overflow
        } else if ratio >= 0.90 {
            Self::Hard
        } else if ratio >= 0.70 {
            Self::Soft
        } else {
            Self::Normal
        }
    }
}

/// One pressure reading.
#[derive(Debug, Clone, Copy)]
pub struct Pressure {
    pub tokens: usize,
    pub max: usize,
    pub ratio: f64,
    pub level: PressureLevel,
}

/// Estimate tokens for raw text: one token per four characters, rounded up.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for one window message, including tool-call payloads.
pub fn estimate_message_tokens(message: &WindowMessage) -> usize {
    let mut tokens = MESSAGE_OVERHEAD + estimate_text_tokens(&message.content);
    for call in &message.tool_calls {
        tokens += estimate_text_tokens(&call.name) + estimate_text_tokens(&call.arguments);
    }
    tokens
}

/// Tracks window size against the configured capacity.
#[derive(Debug, Clone, Copy)]
pub struct ContextManager {
    context_size: usize,
}

impl ContextManager {
    pub fn new(context_size: usize) -> Self {
        Self {
            context_size: context_size.max(1),
        }
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// Estimate the window and classify the result.
    pub fn measure(&self, window: &[WindowMessage]) -> Pressure {
        let tokens: usize = window.iter().map(estimate_message_tokens).sum();
        self.pressure_from_tokens(tokens)
    }

    /// Classify a known token count (e.g. actual usage from the model).
    pub fn pressure_from_tokens(&self, tokens: usize) -> Pressure {
        let ratio = tokens as f64 / self.context_size as f64;
        Pressure {
            tokens,
            max: self.context_size,
            ratio,
            level: PressureLevel::from_ratio(ratio),
        }
    }
}

/// Rewrite the window in place: old oversized tool results are replaced by
/// short summaries. The system prompt and the most recent messages are
/// untouched, as are assistant and user prose (the agent keeps its own
/// words). Idempotent: summarised results are short enough to pass the
/// length check on later runs.
pub fn soft_compact(window: &mut [WindowMessage]) {
    let len = window.len();
    if len <= 1 {
        return;
    }
    let end = len.saturating_sub(KEEP_RECENT).max(1);
    for message in &mut window[1..end] {
        if message.role == Role::Tool && message.content.len() > TOOL_SUMMARY_THRESHOLD {
            message.content = summarize_tool_result(&message.content);
        }
    }
}

fn summarize_tool_result(content: &str) -> String {
    let preview: String = content.chars().take(SUMMARY_PREVIEW_CHARS).collect();
    format!(
        "[Summarized tool result: {preview}... ({} chars total)]",
        content.len()
    )
}

/// Compute the handoff summary carried into the next session. Built
/// deterministically from the window so replays agree.
pub fn handoff_summary(window: &[WindowMessage]) -> String {
    let assistant_turns = window
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();
    let tool_uses: usize = window
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.tool_calls.len())
        .sum();

    let last_activity = window
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.content.is_empty())
        .map(|m| {
            let digest: String = m.content.chars().take(SUMMARY_PREVIEW_CHARS).collect();
            format!(" Last assistant output: {digest}")
        })
        .unwrap_or_default();

    format!(
        "Previous session ended due to context limits after {assistant_turns} assistant \
         turns and {tool_uses} tool uses.{last_activity}"
    )
}

/// Format the handoff block placed at `window[1]` of a fresh session.
pub fn handoff_block(summary: &str) -> WindowMessage {
    WindowMessage::system(format!("[Session handoff]\n{summary}"))
}
