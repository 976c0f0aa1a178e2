//! Tool trait and execution context.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::broadcast::EventHub;
use crate::error::ToolError;
use crate::store::Store;

/// Cooperative interrupt signal passed to tools.
///
/// Raised while user input is pending; tools that block for bounded
/// periods poll it at sub-second cadence and return a partial-completion
/// message when it reports true.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context carried into every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    /// Filesystem root the filesystem/terminal tools are confined to.
    pub workspace: PathBuf,
    pub store: Arc<Store>,
    pub hub: EventHub,
    pub interrupt: InterruptFlag,
}

impl ToolContext {
    pub fn new(
        workspace: PathBuf,
        store: Arc<Store>,
        hub: EventHub,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            workspace,
            store,
            hub,
            interrupt,
        }
    }

    /// True when a user input is pending and the tool should wrap up.
    pub fn interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }
}

/// Trait for tools the agent can use.
///
/// Every tool takes a JSON argument object and returns a text result.
/// Errors never escape the dispatcher: they are converted to
/// `Error:`-prefixed strings and delivered to the model as ordinary tool
/// results.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used for dispatch and model advertisement.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute with the given parameters.
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError>;
}
