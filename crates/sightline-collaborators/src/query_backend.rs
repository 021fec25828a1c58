//! HTTP query backend
//!
//! Posts `{"query": "..."}` to a query service and expects either
//! `{"columns": [...], "rows": [[...], ...]}` or an error body of the form
//! `{"error": {"kind": "syntax" | "execution", "message": "..."}}`.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_engine::{CollaboratorError, QueryBackend, QueryRows};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Query service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryBackendConfig {
    /// Endpoint accepting query requests
    pub url: String,
    /// Per-query timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for QueryBackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123/query".to_string(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: QueryErrorDetail,
}

#[derive(Debug, Deserialize)]
struct QueryErrorDetail {
    kind: String,
    message: String,
}

/// Executes queries against an HTTP query service.
pub struct HttpQueryBackend {
    http_client: reqwest::Client,
    config: QueryBackendConfig,
}

impl HttpQueryBackend {
    pub fn new(config: QueryBackendConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            config,
        }
    }

    async fn post(&self, query: &str) -> Result<QueryRows, CollaboratorError> {
        let response = self
            .http_client
            .post(&self.config.url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| CollaboratorError::ServiceError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CollaboratorError::RateLimited);
        }
        let body = response
            .text()
            .await
            .map_err(|e| CollaboratorError::ServiceError(e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| CollaboratorError::MalformedOutput(e.to_string()))
        } else if status.is_client_error() {
            Err(classify_error(&body))
        } else {
            Err(CollaboratorError::ServiceError(format!(
                "Query service error {}: {}",
                status, body
            )))
        }
    }
}

/// Map a query-service error body onto the collaborator taxonomy.
fn classify_error(body: &str) -> CollaboratorError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) if error.kind == "syntax" => {
            CollaboratorError::SyntaxError(error.message)
        }
        Ok(ErrorBody { error }) => CollaboratorError::ExecutionError(error.message),
        Err(_) => CollaboratorError::ExecutionError(body.trim().to_string()),
    }
}

#[async_trait]
impl QueryBackend for HttpQueryBackend {
    async fn execute(&self, query: &str) -> Result<QueryRows, CollaboratorError> {
        log::debug!("Executing query ({} chars) against {}", query.len(), self.config.url);
        tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), self.post(query))
            .await
            .map_err(|_| CollaboratorError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_syntax_error() {
        let err = classify_error(r#"{"error": {"kind": "syntax", "message": "near FRM"}}"#);
        assert_eq!(err, CollaboratorError::SyntaxError("near FRM".into()));
    }

    #[test]
    fn test_classify_execution_error() {
        let body = r#"{"error": {"kind": "execution", "message": "division by zero"}}"#;
        let err = classify_error(body);
        assert_eq!(err, CollaboratorError::ExecutionError("division by zero".into()));

        let err = classify_error("bad request");
        assert_eq!(err, CollaboratorError::ExecutionError("bad request".into()));
    }

    #[test]
    fn test_rows_body_parses() {
        let rows: QueryRows =
            serde_json::from_str(r#"{"columns": ["n"], "rows": [[1], [2]]}"#).unwrap();
        assert_eq!(rows.row_count(), 2);
    }

    #[test]
    fn test_config_defaults() {
        let config: QueryBackendConfig =
            serde_json::from_str(r#"{"url": "http://db/query"}"#).unwrap();
        assert_eq!(config.url, "http://db/query");
        assert_eq!(config.timeout_ms, 30_000);
    }
}
