//! Web fetch and web search tools.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext};

/// Maximum fetched body size (512KB).
const MAX_BODY_SIZE: usize = 512 * 1024;

/// Request timeout for both tools.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Fetch a URL and return its body as text.
pub struct WebFetchTool {
    client: Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP GET and return the response body as text, \
         truncated at 512KB."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'url'".into()))?;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidParameters(format!(
                "only http/https URLs are supported: {url}"
            )));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read body: {e}")))?;

        let truncated = if body.len() > MAX_BODY_SIZE {
            let head: String = body.chars().take(MAX_BODY_SIZE).collect();
            format!("{head}\n... [truncated, {} bytes total]", body.len())
        } else {
            body
        };

        if status.is_success() {
            Ok(truncated)
        } else {
            Ok(format!("HTTP {status}\n{truncated}"))
        }
    }
}

/// Web search through a JSON search API. Only registered when a search
/// API key is configured.
pub struct WebSearchTool {
    client: Client,
    api_key: SecretString,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: http_client(),
            api_key,
            endpoint: "https://api.search.brave.com/res/v1/web/search".to_string(),
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top results as title, URL, and snippet."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'query'".into()))?;
        let max_results = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .min(20) as usize;

        let url = format!(
            "{}?q={}&count={max_results}",
            self.endpoint,
            urlencoding::encode(query)
        );

        let response = self
            .client
            .get(&url)
            .header("X-Subscription-Token", self.api_key.expose_secret())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::ExecutionFailed(format!(
                "search API returned HTTP {status}: {body}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("bad search response: {e}")))?;

        Ok(format_results(&payload, max_results))
    }
}

fn format_results(payload: &serde_json::Value, max_results: usize) -> String {
    let results = payload
        .pointer("/web/results")
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[]);

    if results.is_empty() {
        return "No results found.".to_string();
    }

    results
        .iter()
        .take(max_results)
        .enumerate()
        .map(|(i, r)| {
            let title = r.get("title").and_then(|v| v.as_str()).unwrap_or("(untitled)");
            let url = r.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let description = r
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            format!("{}. {title}\n   {url}\n   {description}", i + 1)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
