//! Notable tool: the agent's own highlight reel.
//!
//! Notables live outside the raw conversation log and survive session
//! handoffs, which makes this one of the agent's durable memories.

use async_trait::async_trait;

use crate::broadcast::HubEvent;
use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext};

#[derive(Debug, Default)]
pub struct NotableTool;

impl NotableTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for NotableTool {
    fn name(&self) -> &str {
        "notable"
    }

    fn description(&self) -> &str {
        "Record a notable: a labelled highlight surfaced to the operator, kept \
         outside the conversation log. Use it for findings, decisions, and \
         anything worth remembering across sessions."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "label": {
                    "type": "string",
                    "description": "Short title for the notable"
                },
                "content": {
                    "type": "string",
                    "description": "The notable's body"
                },
                "reason": {
                    "type": "string",
                    "description": "Why this is worth surfacing (optional)"
                }
            },
            "required": ["label", "content"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let label = args
            .get("label")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'label'".into()))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'content'".into()))?;
        let reason = args.get("reason").and_then(|v| v.as_str());

        let notable = ctx
            .store
            .append_notable(label, content, reason, None)
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to save notable: {e}")))?;

        ctx.hub.publish(HubEvent::Notable(notable));

        Ok(format!("Recorded notable: {label}"))
    }
}
