//! Tool registry and dispatch.
//!
//! Dispatch is by string name over an immutable map built at startup.
//! Unknown names and tool failures come back as `Error:`-prefixed strings,
//! never as errors: the model is expected to read them and adapt.
//!
//! Any tool can be invoked three ways:
//! - foreground (default): block until complete, return the result;
//! - background (`"background": true`): create a task row, spawn the
//!   work, return `{"task_id": ...}` immediately;
//! - timed (`"timeout": <ms>`): race the work against the deadline; on
//!   timeout the work keeps running against its task row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::model::ToolDefinition;
use crate::tools::args::parse_arguments;
use crate::tools::tool::{Tool, ToolContext};

/// Immutable name → handler map.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Tool advertisement for the model's `tools` parameter.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Invoke a tool by name with raw argument text from the model.
    pub async fn dispatch(&self, name: &str, raw_args: &str, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: unknown tool '{name}'");
        };

        let mut args = parse_arguments(raw_args);

        // Dispatcher-level invocation controls, stripped before the tool
        // sees the arguments.
        let background = args
            .get("background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let timeout_ms = args.get("timeout").and_then(|v| v.as_u64());
        if let Some(obj) = args.as_object_mut() {
            obj.remove("background");
            obj.remove("timeout");
        }

        if background {
            return self.dispatch_background(tool, name, args, ctx).await;
        }
        if let Some(ms) = timeout_ms {
            return self.dispatch_timed(tool, name, args, ctx, ms).await;
        }

        match tool.execute(args, ctx).await {
            Ok(result) => result,
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Spawn the work against a fresh task row and return immediately.
    async fn dispatch_background(
        &self,
        tool: &Arc<dyn Tool>,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> String {
        let input = args.to_string();
        let task_id = match ctx.store.create_task(name, &input) {
            Ok(id) => id,
            Err(e) => return format!("Error: failed to create background task: {e}"),
        };

        spawn_task_work(tool.clone(), args, ctx.clone(), task_id.clone());

        serde_json::json!({ "task_id": task_id }).to_string()
    }

    /// Race the work against a deadline; the loser keeps running.
    async fn dispatch_timed(
        &self,
        tool: &Arc<dyn Tool>,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
        timeout_ms: u64,
    ) -> String {
        let input = args.to_string();
        let task_id = match ctx.store.create_task(name, &input) {
            Ok(id) => id,
            Err(e) => return format!("Error: failed to create background task: {e}"),
        };

        let mut handle = spawn_task_work(tool.clone(), args, ctx.clone(), task_id.clone());

        match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                let message = format!("Error: tool task failed: {join_err}");
                ctx.store.fail_task(&task_id, &message).ok();
                message
            }
            Err(_) => {
                // Deadline won. Dropping the handle detaches the work; it
                // will still settle the task row on completion.
                tracing::debug!(tool = name, task_id = %task_id, "timed invocation backgrounded");
                serde_json::json!({
                    "task_id": task_id,
                    "message": "Timeout exceeded, backgrounded",
                })
                .to_string()
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a tool invocation to completion, settling its task row either way,
/// and return the result string.
fn spawn_task_work(
    tool: Arc<dyn Tool>,
    args: serde_json::Value,
    ctx: ToolContext,
    task_id: String,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        match tool.execute(args, &ctx).await {
            Ok(result) => {
                if let Err(e) = ctx.store.complete_task(&task_id, &result) {
                    tracing::error!(task_id = %task_id, "failed to record task completion: {e}");
                }
                result
            }
            Err(e) => {
                let message = format!("Error: {e}");
                if let Err(store_err) = ctx.store.fail_task(&task_id, &message) {
                    tracing::error!(task_id = %task_id, "failed to record task failure: {store_err}");
                }
                message
            }
        }
    })
}
