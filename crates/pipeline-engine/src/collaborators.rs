//! Interfaces to the external systems a run depends on.
//!
//! Steps only ever reach the outside world through these traits, so a step
//! contains no transport or concurrency logic of its own. Per-call timeouts
//! are the implementation's concern and surface as
//! [`CollaboratorError::Timeout`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::state::{ConversationTurn, QueryRows};

/// Options for a completion or extraction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionOptions {
    /// Model name
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens to generate (None = backend default)
    pub max_tokens: Option<u32>,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: None,
            timeout_ms: 60_000,
        }
    }
}

/// Free-text language model completion.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, CollaboratorError>;
}

/// Language model completion constrained to a JSON schema.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        options: &CompletionOptions,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Run an extraction and deserialize the result into `T`.
pub async fn extract_typed<T: DeserializeOwned>(
    service: &dyn ExtractionService,
    prompt: &str,
    schema: &serde_json::Value,
    options: &CompletionOptions,
) -> Result<T, CollaboratorError> {
    let value = service.extract(prompt, schema, options).await?;
    serde_json::from_value(value).map_err(|e| CollaboratorError::MalformedOutput(e.to_string()))
}

/// Analytical query execution backend.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn execute(&self, query: &str) -> Result<QueryRows, CollaboratorError>;
}

/// Conversation history keyed by user and session.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        user_id: &str,
        session_id: &str,
        turn: ConversationTurn,
    ) -> Result<(), CollaboratorError>;

    /// Read up to `limit` of the most recent turns, oldest first.
    async fn read(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Plan, Route};
    use serde_json::json;

    struct FixedExtraction(serde_json::Value);

    #[async_trait]
    impl ExtractionService for FixedExtraction {
        async fn extract(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            _options: &CompletionOptions,
        ) -> Result<serde_json::Value, CollaboratorError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_extract_typed() {
        let service = FixedExtraction(json!({"summary": "count rows", "route": "query"}));
        let plan: Plan = extract_typed(&service, "p", &json!({}), &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.route, Route::Query);
        assert!(plan.focus.is_empty());
    }

    #[tokio::test]
    async fn test_extract_typed_malformed() {
        let service = FixedExtraction(json!({"route": "sideways"}));
        let err = extract_typed::<Plan>(&service, "p", &json!({}), &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::MalformedOutput(_)));
    }

    #[test]
    fn test_completion_options_defaults_fill_missing_fields() {
        let options: CompletionOptions =
            serde_json::from_value(json!({"model": "llama3"})).unwrap();
        assert_eq!(options.model, "llama3");
        assert_eq!(options.timeout_ms, 60_000);
    }
}
