//! Filesystem tool, confined to the workspace root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum content size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Resolve a path against the workspace root and reject escapes.
///
/// Non-existent targets are checked through their nearest existing parent
/// so writes to fresh files still validate.
pub(crate) fn resolve_in_workspace(path_str: &str, workspace: &Path) -> Result<PathBuf, ToolError> {
    let requested = Path::new(path_str);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        workspace.join(requested)
    };

    let workspace_canonical = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let check = if joined.exists() {
        joined.canonicalize().unwrap_or_else(|_| joined.clone())
    } else {
        let parent = joined.parent().unwrap_or(&joined);
        let canonical_parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
        match joined.file_name() {
            Some(name) => canonical_parent.join(name),
            None => canonical_parent,
        }
    };

    if !check.starts_with(&workspace_canonical) {
        return Err(ToolError::NotAuthorized(format!(
            "path escapes workspace: {path_str}"
        )));
    }
    Ok(check)
}

/// File operations inside the workspace.
#[derive(Debug, Default)]
pub struct FilesystemTool;

impl FilesystemTool {
    pub fn new() -> Self {
        Self
    }

    async fn read(&self, path: &Path) -> Result<String, ToolError> {
        let meta = fs::metadata(path).await?;
        if meta.len() > MAX_READ_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "file too large to read ({} bytes, limit {MAX_READ_SIZE})",
                meta.len()
            )));
        }
        Ok(fs::read_to_string(path).await?)
    }

    async fn write(&self, path: &Path, content: &str, append: bool) -> Result<String, ToolError> {
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "content too large to write ({} bytes, limit {MAX_WRITE_SIZE})",
                content.len()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(content.as_bytes()).await?;
        } else {
            fs::write(path, content).await?;
        }
        Ok(format!(
            "{} {} bytes to {}",
            if append { "Appended" } else { "Wrote" },
            content.len(),
            path.display()
        ))
    }

    async fn list(&self, path: &Path) -> Result<String, ToolError> {
        let mut entries = fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let suffix = if entry.file_type().await?.is_dir() { "/" } else { "" };
            names.push(format!("{name}{suffix}"));
            if names.len() >= MAX_DIR_ENTRIES {
                names.push(format!("... (truncated at {MAX_DIR_ENTRIES} entries)"));
                break;
            }
        }
        names.sort();
        if names.is_empty() {
            Ok("(empty directory)".to_string())
        } else {
            Ok(names.join("\n"))
        }
    }
}

#[async_trait]
impl Tool for FilesystemTool {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "Read, write, append, list, mkdir, or delete files inside the workspace. \
         This is your durable memory: anything you want to survive a session \
         handoff should be written here."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["read", "write", "append", "list", "mkdir", "delete"],
                    "description": "The file operation to perform"
                },
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Content for write/append operations"
                }
            },
            "required": ["operation", "path"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let operation = args
            .get("operation")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'operation'".into()))?;
        let path_str = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'path'".into()))?;

        let path = resolve_in_workspace(path_str, &ctx.workspace)?;

        match operation {
            "read" => self.read(&path).await,
            "write" | "append" => {
                let content = args
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidParameters("missing 'content'".into()))?;
                self.write(&path, content, operation == "append").await
            }
            "list" => self.list(&path).await,
            "mkdir" => {
                fs::create_dir_all(&path).await?;
                Ok(format!("Created directory {}", path.display()))
            }
            "delete" => {
                let meta = fs::metadata(&path).await?;
                if meta.is_dir() {
                    fs::remove_dir(&path).await?;
                } else {
                    fs::remove_file(&path).await?;
                }
                Ok(format!("Deleted {}", path.display()))
            }
            other => Err(ToolError::InvalidParameters(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventHub;
    use crate::store::Store;
    use crate::tools::tool::InterruptFlag;
    use std::sync::Arc;

    fn ctx(workspace: &Path) -> ToolContext {
        ToolContext::new(
            workspace.to_path_buf(),
            Arc::new(Store::open_in_memory().unwrap()),
            EventHub::new(),
            InterruptFlag::new(),
        )
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let tool = FilesystemTool::new();

        let out = tool
            .execute(
                serde_json::json!({"operation": "write", "path": "notes/today.md", "content": "remember this"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.starts_with("Wrote"));

        let content = tool
            .execute(
                serde_json::json!({"operation": "read", "path": "notes/today.md"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(content, "remember this");
    }

    #[tokio::test]
    async fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let tool = FilesystemTool::new();

        for part in ["a", "b"] {
            tool.execute(
                serde_json::json!({"operation": "append", "path": "log.txt", "content": part}),
                &ctx,
            )
            .await
            .unwrap();
        }
        let content = tool
            .execute(serde_json::json!({"operation": "read", "path": "log.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(content, "ab");
    }

    #[tokio::test]
    async fn test_list_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();

        let tool = FilesystemTool::new();
        let listing = tool
            .execute(serde_json::json!({"operation": "list", "path": "."}), &ctx)
            .await
            .unwrap();
        assert!(listing.contains("file.txt"));
        assert!(listing.contains("sub/"));
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let tool = FilesystemTool::new();

        let result = tool
            .execute(
                serde_json::json!({"operation": "read", "path": "../../etc/passwd"}),
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(ToolError::NotAuthorized(_))));

        let result = tool
            .execute(
                serde_json::json!({"operation": "read", "path": "/etc/passwd"}),
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(ToolError::NotAuthorized(_))));
    }

    #[tokio::test]
    async fn test_delete_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();

        let tool = FilesystemTool::new();
        tool.execute(
            serde_json::json!({"operation": "delete", "path": "gone.txt"}),
            &ctx,
        )
        .await
        .unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let tool = FilesystemTool::new();
        let result = tool
            .execute(serde_json::json!({"operation": "move", "path": "a"}), &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::InvalidParameters(_))));
    }
}
