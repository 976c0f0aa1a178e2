//! Configuration for the harness.
//!
//! Settings come from an optional TOML file with environment-variable
//! overrides (`VIGIL_*`). Everything has a workable default except the
//! search API key, which simply disables the web-search tool when absent.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default port the gateway binds to.
const DEFAULT_LISTEN_PORT: u16 = 8600;

/// Default context window capacity, in estimated tokens.
const DEFAULT_CONTEXT_SIZE: usize = 32_768;

/// Model endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible chat-completions endpoint.
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,
    /// Model identifier passed to the endpoint.
    #[serde(default = "default_model_name")]
    pub name: String,
}

fn default_model_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model_name() -> String {
    "qwen3:14b".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_model_endpoint(),
            name: default_model_name(),
        }
    }
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    /// Enables the web-search tool when present.
    pub search_api_key: Option<SecretString>,
    /// Port on which the gateway binds.
    pub listen_port: u16,
    /// Filesystem root the filesystem/terminal tools are confined to,
    /// and parent directory of the durable store.
    pub workspace_path: PathBuf,
    /// Token capacity used as the denominator for context pressure.
    pub context_size: usize,
    /// Operator-supplied system prompt file; built-in default if absent.
    pub system_prompt_path: Option<PathBuf>,
    /// Operator-supplied autonomous-nudge prompt file.
    pub autonomous_prompt_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            search_api_key: None,
            listen_port: DEFAULT_LISTEN_PORT,
            workspace_path: PathBuf::from("./workspace"),
            context_size: DEFAULT_CONTEXT_SIZE,
            system_prompt_path: None,
            autonomous_prompt_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })?;
                toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("VIGIL_MODEL_ENDPOINT") {
            self.model.endpoint = v;
        }
        if let Ok(v) = std::env::var("VIGIL_MODEL_NAME") {
            self.model.name = v;
        }
        if let Ok(v) = std::env::var("VIGIL_SEARCH_API_KEY") {
            if !v.is_empty() {
                self.search_api_key = Some(SecretString::from(v));
            }
        }
        if let Ok(v) = std::env::var("VIGIL_LISTEN_PORT") {
            self.listen_port = v.parse().map_err(|_| ConfigError::Invalid {
                field: "listen_port".to_string(),
                reason: format!("not a port number: {v}"),
            })?;
        }
        if let Ok(v) = std::env::var("VIGIL_WORKSPACE_PATH") {
            self.workspace_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VIGIL_CONTEXT_SIZE") {
            self.context_size = v.parse().map_err(|_| ConfigError::Invalid {
                field: "context_size".to_string(),
                reason: format!("not a token count: {v}"),
            })?;
        }
        Ok(())
    }

    /// Path of the SQLite database file inside the workspace.
    pub fn store_path(&self) -> PathBuf {
        self.workspace_path.join("vigil.db")
    }
}
