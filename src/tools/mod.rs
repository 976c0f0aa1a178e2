//! The agent's tools.
//!
//! Tools are the agent's interface to the outside world and its durable
//! memory across session handoffs. The set is closed at startup: a lookup
//! on an immutable map, one schema colocated with each handler.

mod args;
mod fs;
mod notable;
mod registry;
mod shell;
mod sleep;
mod task;
mod tool;
mod web;

pub use args::parse_arguments;
pub use fs::FilesystemTool;
pub use notable::NotableTool;
pub use registry::ToolRegistry;
pub use shell::TerminalTool;
pub use sleep::SleepTool;
pub use task::{TaskStatusTool, TaskWaitTool};
pub use tool::{InterruptFlag, Tool, ToolContext};
pub use web::{WebFetchTool, WebSearchTool};

use std::sync::Arc;

use crate::config::Config;

/// Build the registry of built-in tools. Web search is only registered
/// when a search API key is configured.
pub fn builtin_registry(config: &Config) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FilesystemTool::new()));
    registry.register(Arc::new(TerminalTool::new()));
    registry.register(Arc::new(WebFetchTool::new()));
    registry.register(Arc::new(SleepTool::new()));
    registry.register(Arc::new(NotableTool::new()));
    registry.register(Arc::new(TaskStatusTool::new()));
    registry.register(Arc::new(TaskWaitTool::new()));
    if let Some(key) = &config.search_api_key {
        registry.register(Arc::new(WebSearchTool::new(key.clone())));
    }
    registry
}
