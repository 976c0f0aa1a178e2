//! System and autonomous prompts with `{{var}}` substitution.
//!
//! Operators may supply prompt files through the config; otherwise the
//! built-in defaults below are used. Templates support substitution over
//! `port`, `workspace`, `ollama_endpoint`, `ollama_model`, and
//! `context_size`.

use std::path::Path;

use crate::config::Config;

/// Built-in system prompt used when no file is configured.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a long-running autonomous agent. You live in a perpetual loop: you \
receive messages, think, use tools, and act. Your conversation window is \
finite ({{context_size}} tokens) and will periodically be compacted; use the \
filesystem and notable tools to persist anything you want to survive a \
session handoff. Your workspace root is {{workspace}}. A human operator can \
watch and steer you through a control surface on port {{port}}.";

/// Built-in autonomous-nudge prompt appended on each autonomous tick.
const DEFAULT_AUTONOMOUS_PROMPT: &str = "\
Continue working autonomously. Review your recent context, decide the most \
useful next action, and take it. If there is nothing worth doing, briefly \
note why and wait for the next tick.";

/// Render a template by substituting `{{var}}` placeholders.
pub fn render(template: &str, config: &Config) -> String {
    template
        .replace("{{port}}", &config.listen_port.to_string())
        .replace("{{workspace}}", &config.workspace_path.display().to_string())
        .replace("{{ollama_endpoint}}", &config.model.endpoint)
        .replace("{{ollama_model}}", &config.model.name)
        .replace("{{context_size}}", &config.context_size.to_string())
}

fn load_template(path: Option<&Path>, default: &str) -> String {
    match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("failed to read prompt file {}: {e}, using default", p.display());
                default.to_string()
            }
        },
        None => default.to_string(),
    }
}

/// Load and render the system prompt.
pub fn system_prompt(config: &Config) -> String {
    let template = load_template(config.system_prompt_path.as_deref(), DEFAULT_SYSTEM_PROMPT);
    render(&template, config)
}

/// Load and render the autonomous-nudge prompt.
pub fn autonomous_prompt(config: &Config) -> String {
    let template = load_template(
        config.autonomous_prompt_path.as_deref(),
        DEFAULT_AUTONOMOUS_PROMPT,
    );
    render(&template, config)
}
