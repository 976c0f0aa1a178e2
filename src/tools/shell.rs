//! Terminal tool: shell command execution with a safety blocklist.
//!
//! The policy is intentionally conservative, not hermetic: a small set of
//! catastrophic command patterns is rejected outright, and working
//! directories must resolve inside the workspace root.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexSet;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::ToolError;
use crate::tools::fs::resolve_in_workspace;
use crate::tools::tool::{Tool, ToolContext};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout when the caller sets none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Command patterns that are always rejected.
static BLOCKED_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"rm\s+-rf?\s+/\s*($|;|&|\|)",
        r"rm\s+-rf?\s+/\*",
        r"rm\s+-rf?\s+~",
        r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;",
        r">\s*/dev/sd[a-z]",
        r"\bdd\b.*of=/dev/sd[a-z]",
        r"\bmkfs\b",
        r"chmod\s+-R\s+777\s+/\s*($|;|&)",
    ])
    .expect("valid blocklist patterns")
});

/// Shell command execution confined to the workspace.
#[derive(Debug)]
pub struct TerminalTool {
    timeout: Duration,
}

impl TerminalTool {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn check_blocked(&self, command: &str) -> Result<(), ToolError> {
        if BLOCKED_PATTERNS.is_match(command) {
            return Err(ToolError::NotAuthorized(format!(
                "command matches a blocked pattern: {}",
                truncate_chars(command, 100)
            )));
        }
        Ok(())
    }

    async fn run(&self, command: &str, workdir: &PathBuf) -> Result<String, ToolError> {
        let mut child = Command::new("sh")
            .args(["-c", command])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn command: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let result = tokio::time::timeout(self.timeout, async {
            // Drain pipes before waiting so large output cannot deadlock
            // the child.
            let mut stdout = Vec::new();
            if let Some(ref mut out) = stdout_pipe {
                out.read_to_end(&mut stdout).await?;
            }
            let mut stderr = Vec::new();
            if let Some(ref mut err) = stderr_pipe {
                err.read_to_end(&mut stderr).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        })
        .await;

        match result {
            Ok(Ok((stdout, stderr, status))) => {
                let stdout = String::from_utf8_lossy(&stdout);
                let stderr = String::from_utf8_lossy(&stderr);
                let combined = if stderr.is_empty() {
                    stdout.into_owned()
                } else if stdout.is_empty() {
                    stderr.into_owned()
                } else {
                    format!("{stdout}\n--- stderr ---\n{stderr}")
                };
                let exit = status.code().unwrap_or(-1);
                if exit == 0 {
                    Ok(truncate_output(&combined))
                } else {
                    Ok(format!(
                        "{}\n(exit code {exit})",
                        truncate_output(&combined)
                    ))
                }
            }
            Ok(Err(e)) => Err(ToolError::ExecutionFailed(format!(
                "command execution failed: {e}"
            ))),
            Err(_) => {
                let _ = child.kill().await;
                Err(ToolError::Timeout(self.timeout))
            }
        }
    }
}

impl Default for TerminalTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the workspace. Output is captured and \
         truncated at 64KB. Pass \"background\": true to run long commands as a \
         polled task, or \"timeout\": <ms> to background automatically when the \
         deadline passes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory relative to the workspace root (optional)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'command'".into()))?;

        self.check_blocked(command)?;

        let workdir = match args.get("workdir").and_then(|v| v.as_str()) {
            Some(dir) => resolve_in_workspace(dir, &ctx.workspace)?,
            None => ctx.workspace.clone(),
        };

        self.run(command, &workdir).await
    }
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head: String = s.chars().take(half).collect();
    let tail: String = s
        .chars()
        .rev()
        .take(half)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!(
        "{head}\n... [truncated {} bytes] ...\n{tail}",
        s.len() - MAX_OUTPUT_SIZE
    )
}

fn truncate_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(limit).collect::<String>())
    }
}
