//! OpenAI-compatible chat completion client
//!
//! Talks to any server exposing `/v1/chat/completions` (OpenAI, Ollama,
//! llama.cpp, vLLM, ...). Structured extraction asks for a JSON-schema
//! constrained response and parses the message content as JSON.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_engine::{CollaboratorError, CompletionOptions, CompletionService, ExtractionService};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Connection settings for an OpenAI-compatible server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmConfig {
    /// Base URL without the `/v1` suffix
    pub base_url: String,
    /// Environment variable holding the API key (unset = no auth header)
    pub api_key_env: Option<String>,
    /// Default options for every call
    pub options: CompletionOptions,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key_env: None,
            options: CompletionOptions::default(),
        }
    }
}

/// Completion and extraction over an OpenAI-compatible HTTP API.
pub struct OpenAiClient {
    /// HTTP client for API requests
    http_client: reqwest::Client,
    /// Base URL of the server
    base_url: String,
    /// Bearer token, if the server needs one
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build a client from config, reading the API key from the environment.
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = config.api_key_env.as_deref().and_then(|var| match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                log::warn!("API key variable {} is not set, sending requests without auth", var);
                None
            }
        });
        Self::new(&config.base_url, api_key)
    }

    fn request_body(prompt: &str, options: &CompletionOptions) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": options.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    async fn chat(
        &self,
        body: Value,
        options: &CompletionOptions,
    ) -> Result<String, CollaboratorError> {
        tokio::time::timeout(Duration::from_millis(options.timeout_ms), self.post_chat(&body))
            .await
            .map_err(|_| CollaboratorError::Timeout)?
    }

    async fn post_chat(&self, body: &Value) -> Result<String, CollaboratorError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.http_client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CollaboratorError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::ServiceError(format!("API error {}: {}", status, body)));
        }
        let json: Value = response
            .json()
            .await
            .map_err(|e| {
                CollaboratorError::MalformedOutput(format!("Failed to parse response: {}", e))
            })?;
        message_content(&json)
    }
}

fn http_error(e: reqwest::Error) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Timeout
    } else {
        CollaboratorError::ServiceError(e.to_string())
    }
}

fn message_content(json: &Value) -> Result<String, CollaboratorError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| CollaboratorError::MalformedOutput("Missing message content".to_string()))
}

/// Parse a JSON reply, tolerating a surrounding markdown fence.
fn parse_json_reply(text: &str) -> Result<Value, CollaboratorError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| CollaboratorError::MalformedOutput(e.to_string()))
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, CollaboratorError> {
        self.chat(Self::request_body(prompt, options), options).await
    }
}

#[async_trait]
impl ExtractionService for OpenAiClient {
    async fn extract(
        &self,
        prompt: &str,
        schema: &Value,
        options: &CompletionOptions,
    ) -> Result<Value, CollaboratorError> {
        let mut body = Self::request_body(prompt, options);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": "output", "schema": schema },
        });
        let reply = self.chat(body, options).await?;
        parse_json_reply(&reply)
    }
}
