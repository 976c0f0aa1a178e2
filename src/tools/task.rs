//! Polling tools for background tasks.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ToolError;
use crate::store::{BackgroundTask, TaskStatus};
use crate::tools::tool::{Tool, ToolContext};

/// Poll interval for `task_wait`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default `task_wait` timeout.
const DEFAULT_WAIT_MS: u64 = 30_000;

fn task_payload(task: &BackgroundTask) -> String {
    serde_json::json!({
        "task_id": task.id,
        "tool": task.tool_name,
        "status": task.status.as_str(),
        "result": task.result,
        "error": task.error,
    })
    .to_string()
}

/// Report the current status of a background task.
#[derive(Debug, Default)]
pub struct TaskStatusTool;

impl TaskStatusTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for TaskStatusTool {
    fn name(&self) -> &str {
        "task_status"
    }

    fn description(&self) -> &str {
        "Check the status of a background task by id. Returns status plus the \
         result or error once the task is finished."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The background task id"
                }
            },
            "required": ["task_id"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let task_id = args
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'task_id'".into()))?;

        let task = ctx
            .store
            .get_task(task_id)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .ok_or_else(|| ToolError::InvalidParameters(format!("no such task: {task_id}")))?;

        Ok(task_payload(&task))
    }
}

/// Block until a background task finishes or a timeout elapses.
#[derive(Debug, Default)]
pub struct TaskWaitTool;

impl TaskWaitTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for TaskWaitTool {
    fn name(&self) -> &str {
        "task_wait"
    }

    fn description(&self) -> &str {
        "Wait for a background task to finish, polling until it is terminal or \
         the timeout elapses (default 30s). Returns the terminal payload, or the \
         running status if time runs out."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The background task id"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Maximum time to wait, in milliseconds (default 30000)"
                }
            },
            "required": ["task_id"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let task_id = args
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'task_id'".into()))?;
        let timeout_ms = args
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_WAIT_MS);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let task = ctx
                .store
                .get_task(task_id)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
                .ok_or_else(|| {
                    ToolError::InvalidParameters(format!("no such task: {task_id}"))
                })?;

            if task.status != TaskStatus::Running {
                return Ok(task_payload(&task));
            }
            if tokio::time::Instant::now() >= deadline || ctx.interrupted() {
                return Ok(task_payload(&task));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
