//! Streaming chat-completions client.
//!
//! Talks to an OpenAI-compatible endpoint with `stream: true` and
//! `stream_options.include_usage`. Content and reasoning deltas are
//! forwarded as they arrive; tool-call fragments are accumulated by index
//! and returned assembled with the final turn.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ModelError;

/// Chat role in the working window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call requested by the model. Arguments are kept as raw JSON
/// text; lenient repair happens at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One message of the in-memory working window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WindowMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Token usage reported by the endpoint's final chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A tool advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The assembled result of one streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantTurn {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// A single streamed fragment.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Content(String),
    Reasoning(String),
}

/// Parameters for one streamed completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<WindowMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Seam between the executor and the model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream one completion. Deltas are pushed into `deltas` as they
    /// arrive; the assembled turn and final usage come back on return.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<(AssistantTurn, Option<Usage>), ModelError>;
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpModelClient {
    client: Client,
    endpoint: String,
    model: String,
}

impl HttpModelClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.endpoint.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<WireMessage> =
            request.messages.iter().map(WireMessage::from).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }

        body
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<(AssistantTurn, Option<Usage>), ModelError> {
        let url = self.api_url();
        let body = self.build_body(&request);

        tracing::debug!(url = %url, messages = request.messages.len(), "starting stream");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::RequestFailed {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut assembly = StreamAssembly::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ModelError::InvalidStream(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            // SSE frames are newline-delimited; multibyte characters never
            // span a newline, so splitting the byte buffer is safe.
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(assembly.finish());
                }
                for delta in assembly.apply(data) {
                    // A dropped receiver just means nobody wants deltas.
                    let _ = deltas.send(delta).await;
                }
            }
        }

        // Stream closed without the sentinel; return what we assembled.
        tracing::warn!("stream ended without [DONE] sentinel");
        Ok(assembly.finish())
    }
}

// --- Wire types (OpenAI chat-completions format) ---

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

impl From<&WindowMessage> for WireMessage {
    fn from(msg: &WindowMessage) -> Self {
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| WireToolCall {
                        id: tc.id.clone(),
                        call_type: "function",
                        function: WireFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role: msg.role.as_str(),
            content: Some(msg.content.clone()),
            tool_call_id: msg.tool_call_id.clone(),
            tool_calls,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Incremental assembly of a streamed completion.
#[derive(Debug, Default)]
struct StreamAssembly {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
}

impl StreamAssembly {
    /// Apply one `data:` payload, returning the fragments to forward.
    fn apply(&mut self, data: &str) -> Vec<StreamDelta> {
        let payload: ChunkPayload = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("skipping malformed stream chunk: {e}");
                return Vec::new();
            }
        };

        if let Some(usage) = payload.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let mut out = Vec::new();
        for choice in payload.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    out.push(StreamDelta::Content(text));
                }
            }
            if let Some(text) = choice.delta.reasoning {
                if !text.is_empty() {
                    self.reasoning.push_str(&text);
                    out.push(StreamDelta::Reasoning(text));
                }
            }
            if let Some(calls) = choice.delta.tool_calls {
                for fragment in calls {
                    if self.tool_calls.len() <= fragment.index {
                        self.tool_calls.resize(
                            fragment.index + 1,
                            ToolCallRequest {
                                id: String::new(),
                                name: String::new(),
                                arguments: String::new(),
                            },
                        );
                    }
                    let slot = &mut self.tool_calls[fragment.index];
                    if let Some(id) = fragment.id {
                        slot.id = id;
                    }
                    if let Some(function) = fragment.function {
                        if let Some(name) = function.name {
                            slot.name.push_str(&name);
                        }
                        if let Some(args) = function.arguments {
                            slot.arguments.push_str(&args);
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(self) -> (AssistantTurn, Option<Usage>) {
        (
            AssistantTurn {
                content: self.content,
                reasoning: self.reasoning,
                tool_calls: self.tool_calls,
            },
            self.usage,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_roles() {
        let msg = WindowMessage::user("hello");
        let wire = WireMessage::from(&msg);
        assert_eq!(wire.role, "user");
        assert_eq!(wire.content.as_deref(), Some("hello"));
        assert!(wire.tool_calls.is_none());
    }

    #[test]
    fn test_wire_tool_result_carries_call_id() {
        let msg = WindowMessage::tool("call_7", "listing");
        let wire = WireMessage::from(&msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_7"));
    }

    #[test]
    fn test_wire_assistant_tool_calls() {
        let msg = WindowMessage::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "filesystem".into(),
                arguments: r#"{"operation":"list"}"#.into(),
            }],
        );
        let json = serde_json::to_value(WireMessage::from(&msg)).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "filesystem");
        // Arguments travel as a JSON string, not a nested object.
        assert!(json["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn test_assembly_content_deltas() {
        let mut assembly = StreamAssembly::default();
        let d1 = assembly.apply(r#"{"choices":[{"delta":{"content":"hel"}}]}"#);
        let d2 = assembly.apply(r#"{"choices":[{"delta":{"content":"lo"}}]}"#);
        assert_eq!(d1.len(), 1);
        assert_eq!(d2.len(), 1);
        let (turn, usage) = assembly.finish();
        assert_eq!(turn.content, "hello");
        assert!(usage.is_none());
    }

    #[test]
    fn test_assembly_reasoning_separate_from_content() {
        let mut assembly = StreamAssembly::default();
        assembly.apply(r#"{"choices":[{"delta":{"reasoning":"thinking..."}}]}"#);
        assembly.apply(r#"{"choices":[{"delta":{"content":"answer"}}]}"#);
        let (turn, _) = assembly.finish();
        assert_eq!(turn.reasoning, "thinking...");
        assert_eq!(turn.content, "answer");
    }

    #[test]
    fn test_assembly_tool_call_fragments_by_index() {
        let mut assembly = StreamAssembly::default();
        assembly.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"filesystem","arguments":"{\"op"}}]}}]}"#,
        );
        assembly.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"eration\":\"list\"}"}}]}}]}"#,
        );
        let (turn, _) = assembly.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_9");
        assert_eq!(turn.tool_calls[0].name, "filesystem");
        assert_eq!(turn.tool_calls[0].arguments, r#"{"operation":"list"}"#);
    }

    #[test]
    fn test_assembly_parallel_tool_calls() {
        let mut assembly = StreamAssembly::default();
        assembly.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"two"}}]}}]}"#,
        );
        assembly.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"one"}}]}}]}"#,
        );
        let (turn, _) = assembly.finish();
        assert_eq!(turn.tool_calls[0].name, "one");
        assert_eq!(turn.tool_calls[1].name, "two");
    }

    #[test]
    fn test_assembly_usage_chunk() {
        let mut assembly = StreamAssembly::default();
        assembly.apply(
            r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":30,"total_tokens":150}}"#,
        );
        let (_, usage) = assembly.finish();
        let usage = usage.unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn test_assembly_skips_malformed_chunk() {
        let mut assembly = StreamAssembly::default();
        assert!(assembly.apply("not json at all").is_empty());
        assembly.apply(r#"{"choices":[{"delta":{"content":"ok"}}]}"#);
        let (turn, _) = assembly.finish();
        assert_eq!(turn.content, "ok");
    }

    #[test]
    fn test_build_body_includes_stream_options() {
        let client = HttpModelClient::new("http://localhost:11434", "test-model");
        let body = client.build_body(&ChatRequest {
            messages: vec![WindowMessage::system("s"), WindowMessage::user("u")],
            tools: vec![ToolDefinition {
                name: "sleep".into(),
                description: "sleep".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
        });
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "sleep");
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn test_api_url_normalizes_slash() {
        let client = HttpModelClient::new("http://host:1234/", "m");
        assert_eq!(client.api_url(), "http://host:1234/v1/chat/completions");
    }
}
