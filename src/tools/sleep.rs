//! Interruptible sleep tool.
//!
//! Sleeps in 100ms slices, consulting the interrupt probe between slices.
//! This is how a user message reaches the agent promptly while it is
//! waiting: the sleep returns a partial-completion message within one
//! probe interval.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext};

/// Probe interval.
const TICK: Duration = Duration::from_millis(100);

/// Upper bound on a single sleep (10 minutes).
const MAX_SLEEP_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Default)]
pub struct SleepTool;

impl SleepTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Pause for a number of milliseconds. Returns early if user input \
         arrives while sleeping."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "duration_ms": {
                    "type": "integer",
                    "description": "How long to sleep, in milliseconds"
                }
            },
            "required": ["duration_ms"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let duration_ms = args
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'duration_ms'".into()))?;
        let duration_ms = duration_ms.min(MAX_SLEEP_MS);

        let mut elapsed_ms: u64 = 0;
        while elapsed_ms < duration_ms {
            if ctx.interrupted() {
                return Ok(format!(
                    "Sleep interrupted after {elapsed_ms}ms of {duration_ms}ms: user input pending"
                ));
            }
            let slice = TICK.min(Duration::from_millis(duration_ms - elapsed_ms));
            tokio::time::sleep(slice).await;
            elapsed_ms += slice.as_millis() as u64;
        }

        Ok(format!("Slept for {duration_ms}ms"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventHub;
    use crate::store::Store;
    use crate::tools::tool::InterruptFlag;
    use std::sync::Arc;
    use std::time::Instant;

    fn ctx(flag: InterruptFlag) -> ToolContext {
        ToolContext::new(
            std::env::temp_dir(),
            Arc::new(Store::open_in_memory().unwrap()),
            EventHub::new(),
            flag,
        )
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let tool = SleepTool::new();
        let result = tool
            .execute(serde_json::json!({"duration_ms": 120}), &ctx(InterruptFlag::new()))
            .await
            .unwrap();
        assert_eq!(result, "Slept for 120ms");
    }

    #[tokio::test]
    async fn test_sleep_interrupted_within_one_probe_interval() {
        let flag = InterruptFlag::new();
        let tool = SleepTool::new();
        let ctx = ctx(flag.clone());

        let raiser = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            raiser.raise();
        });

        let start = Instant::now();
        let result = tool
            .execute(serde_json::json!({"duration_ms": 10_000}), &ctx)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(result.contains("interrupted"));
        assert!(result.contains("user input pending"));
        // Returned within ~one probe interval of the interrupt, not after
        // the full requested sleep.
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_sleep_requires_duration() {
        let tool = SleepTool::new();
        let result = tool
            .execute(serde_json::json!({}), &ctx(InterruptFlag::new()))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidParameters(_))));
    }
}
