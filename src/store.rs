//! SQLite store for persisting agent data.
//!
//! The store is the only durable owner of records. It lives in a single
//! database file under the workspace root and initialises its own schema.
//! All operations are atomic on a single record.
//!
//! Methods are synchronous behind a `std::sync::Mutex` (not tokio): every
//! call is a short point query and the lock is never held across an
//! `.await` boundary.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    User,
    Assistant,
    System,
    Reasoning,
    ToolCall,
    ToolResult,
    /// A message injected by an external process, e.g. `external:cron`.
    #[serde(untagged)]
    External(String),
}

impl MessageSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Reasoning => "reasoning",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::External(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "reasoning" => Self::Reasoning,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            other => Self::External(other.to_string()),
        }
    }

    /// Construct an `external:<name>` source.
    pub fn external(name: &str) -> Self {
        if name.starts_with("external:") {
            Self::External(name.to_string())
        } else {
            Self::External(format!("external:{name}"))
        }
    }
}

/// One entry in the durable conversation log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub source: MessageSource,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// A curated highlight surfaced by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notable {
    pub id: i64,
    pub label: String,
    pub content: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message_id: Option<i64>,
}

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// A long-running tool invocation polled through the task tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub tool_name: String,
    pub input: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A durable marker partitioning the conversation horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub handoff_summary: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// SQLite-backed store.
pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source      TEXT NOT NULL,
    content     TEXT NOT NULL,
    tool_name   TEXT,
    tool_input  TEXT,
    timestamp   TEXT NOT NULL,
    metadata    TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS notables (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    label       TEXT NOT NULL,
    content     TEXT NOT NULL,
    reason      TEXT,
    message_id  INTEGER,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notables_timestamp ON notables(timestamp);

CREATE TABLE IF NOT EXISTS background_tasks (
    id            TEXT PRIMARY KEY,
    tool_name     TEXT NOT NULL,
    input         TEXT NOT NULL,
    status        TEXT NOT NULL,
    result        TEXT,
    error         TEXT,
    created_at    TEXT NOT NULL,
    completed_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON background_tasks(status);

CREATE TABLE IF NOT EXISTS sessions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at       TEXT NOT NULL,
    handoff_summary  TEXT,
    ended_at         TEXT
);

CREATE TABLE IF NOT EXISTS state (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

impl Store {
    /// Open (or create) the store at the given path and initialise the
    /// schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; nothing to salvage.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Messages ====================

    /// Append a message to the log, returning the persisted record with
    /// its assigned id and server timestamp.
    pub fn append_message(
        &self,
        source: &MessageSource,
        content: &str,
        tool_name: Option<&str>,
        tool_input: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let metadata_text = metadata
            .map(|m| serde_json::to_string(m))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages (source, content, tool_name, tool_input, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                source.as_str(),
                content,
                tool_name,
                tool_input,
                now.to_rfc3339(),
                metadata_text,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(Message {
            id,
            source: source.clone(),
            content: content.to_string(),
            tool_name: tool_name.map(String::from),
            tool_input: tool_input.map(String::from),
            timestamp: now,
            metadata: metadata.cloned(),
        })
    }

    /// All messages, ordered by id ascending.
    pub fn list_messages(&self) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source, content, tool_name, tool_input, timestamp, metadata
             FROM messages ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Messages with id strictly greater than `after_id`, ascending.
    pub fn list_messages_since(&self, after_id: i64) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source, content, tool_name, tool_input, timestamp, metadata
             FROM messages WHERE id > ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([after_id], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ==================== Notables ====================

    pub fn append_notable(
        &self,
        label: &str,
        content: &str,
        reason: Option<&str>,
        message_id: Option<i64>,
    ) -> Result<Notable, StoreError> {
        let now = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO notables (label, content, reason, message_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![label, content, reason, message_id, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        Ok(Notable {
            id,
            label: label.to_string(),
            content: content.to_string(),
            reason: reason.map(String::from),
            timestamp: now,
            message_id,
        })
    }

    /// All notables, newest first.
    pub fn list_notables(&self) -> Result<Vec<Notable>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, label, content, reason, message_id, timestamp
             FROM notables ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Notable {
                id: row.get(0)?,
                label: row.get(1)?,
                content: row.get(2)?,
                reason: row.get(3)?,
                message_id: row.get(4)?,
                timestamp: parse_ts(row.get::<_, String>(5)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ==================== Background tasks ====================

    /// Create a task row in `running` state, returning its id.
    pub fn create_task(&self, tool_name: &str, input: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO background_tasks (id, tool_name, input, status, created_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![id, tool_name, input, now.to_rfc3339()],
        )?;
        Ok(id)
    }

    /// Mark a task completed. No-op if the task is already terminal.
    pub fn complete_task(&self, id: &str, result: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE background_tasks SET status = 'completed', result = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, result, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Mark a task failed. No-op if the task is already terminal.
    pub fn fail_task(&self, id: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE background_tasks SET status = 'failed', error = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<BackgroundTask>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, tool_name, input, status, result, error, created_at, completed_at
             FROM background_tasks WHERE id = ?1",
            [id],
            row_to_task,
        )
        .optional()
        .map_err(Into::into)
    }

    /// List tasks, optionally filtered by status, newest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<BackgroundTask>, StoreError> {
        let conn = self.lock();
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT id, tool_name, input, status, result, error, created_at, completed_at
                     FROM background_tasks WHERE status = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([s.as_str()], row_to_task)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, tool_name, input, status, result, error, created_at, completed_at
                     FROM background_tasks ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], row_to_task)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    // ==================== KV state ====================

    /// Get a state value, falling back to `default` when unset.
    pub fn get_state(
        &self,
        key: &str,
        default: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(default),
        }
    }

    /// Upsert a state value.
    pub fn set_state(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, text],
        )?;
        Ok(())
    }

    // ==================== Sessions ====================

    /// Start a new session. The caller is responsible for ending the
    /// previous one first; `ensure_open_session` and the hard-compaction
    /// path both do.
    pub fn start_session(&self, handoff_summary: Option<&str>) -> Result<Session, StoreError> {
        let now = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (started_at, handoff_summary) VALUES (?1, ?2)",
            params![now.to_rfc3339(), handoff_summary],
        )?;
        Ok(Session {
            id: conn.last_insert_rowid(),
            started_at: now,
            handoff_summary: handoff_summary.map(String::from),
            ended_at: None,
        })
    }

    /// Set `ended_at = now` on the open session, if any.
    pub fn end_current_session(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE ended_at IS NULL",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The open session, or None.
    pub fn current_session(&self) -> Result<Option<Session>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, started_at, handoff_summary, ended_at
             FROM sessions WHERE ended_at IS NULL ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    started_at: parse_ts(row.get::<_, String>(1)?),
                    handoff_summary: row.get(2)?,
                    ended_at: row.get::<_, Option<String>>(3)?.map(parse_ts),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Return the open session, creating one if none exists. Called at
    /// bootstrap to uphold the one-open-session invariant.
    pub fn ensure_open_session(&self) -> Result<Session, StoreError> {
        if let Some(session) = self.current_session()? {
            return Ok(session);
        }
        self.start_session(None)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let metadata: Option<String> = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        source: MessageSource::parse(&row.get::<_, String>(1)?),
        content: row.get(2)?,
        tool_name: row.get(3)?,
        tool_input: row.get(4)?,
        timestamp: parse_ts(row.get::<_, String>(5)?),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackgroundTask> {
    Ok(BackgroundTask {
        id: row.get(0)?,
        tool_name: row.get(1)?,
        input: row.get(2)?,
        status: TaskStatus::parse(&row.get::<_, String>(3)?),
        result: row.get(4)?,
        error: row.get(5)?,
        created_at: parse_ts(row.get::<_, String>(6)?),
        completed_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
