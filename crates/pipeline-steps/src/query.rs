//! Query generation, validation and execution

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_engine::collaborators::extract_typed;
use pipeline_engine::{
    CompletionOptions, CompletionService, ErrorKind, ExtractionService, QueryBackend, Step,
    StepContext, StepFailure, StepResult, Verdict, WorkflowState,
};

use crate::cancellable;
use crate::prompts;

/// Statements that may never reach the query backend.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "ATTACH", "COPY",
];

/// Writes a candidate query, taking earlier rejection reasons into account.
pub struct QueryGenerator {
    completion: Arc<dyn CompletionService>,
    options: CompletionOptions,
}

impl QueryGenerator {
    pub fn new(completion: Arc<dyn CompletionService>, options: CompletionOptions) -> Self {
        Self { completion, options }
    }
}

#[async_trait]
impl Step for QueryGenerator {
    fn name(&self) -> &str {
        "query-generator"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let prompt = prompts::query_prompt(state, &ctx.feedback);
        let call = self.completion.complete(&prompt, &self.options);
        let reply = match cancellable(&ctx.cancellation, call).await {
            Ok(reply) => reply,
            Err(e) => {
                return e.into_step_failure("query generator", ErrorKind::GenerationFailed).into()
            }
        };

        let query = prompts::strip_code_fences(&reply);
        if query.is_empty() {
            return StepResult::fail(
                ErrorKind::GenerationFailed,
                "The query generator returned an empty query",
            );
        }

        let mut next = state.clone();
        next.candidate_query = Some(query.to_string());
        StepResult::proceed(next)
    }
}

/// Checks a candidate query statically, then asks the model for a verdict.
///
/// A query that fails the static checks is rejected without a model call.
pub struct QueryValidator {
    extraction: Arc<dyn ExtractionService>,
    options: CompletionOptions,
}

impl QueryValidator {
    pub fn new(extraction: Arc<dyn ExtractionService>, options: CompletionOptions) -> Self {
        Self { extraction, options }
    }

    /// Read-only, single-statement, non-empty.
    pub fn check_static(query: &str) -> Result<(), String> {
        let body = query.trim().trim_end_matches(';').trim();
        if body.is_empty() {
            return Err("The query is empty".to_string());
        }
        if body.contains(';') {
            return Err("Only a single statement is allowed".to_string());
        }

        let upper = body.to_ascii_uppercase();
        let first = upper.split_whitespace().next().unwrap_or_default();
        if first != "SELECT" && first != "WITH" {
            return Err(format!("Only read-only queries are allowed, found {}", first));
        }
        let words = upper.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'));
        for word in words {
            if FORBIDDEN_KEYWORDS.contains(&word) {
                return Err(format!("Only read-only queries are allowed, found {}", word));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for QueryValidator {
    fn name(&self) -> &str {
        "query-validator"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let Some(query) = state.candidate_query.as_deref() else {
            return StepFailure::invariant("validating without a candidate query").into();
        };

        let verdict = match Self::check_static(query) {
            Err(reason) => Verdict::reject(reason),
            Ok(()) => {
                let prompt = prompts::query_review_prompt(state, query);
                let schema = prompts::verdict_schema();
                let call = extract_typed::<Verdict>(
                    self.extraction.as_ref(),
                    &prompt,
                    &schema,
                    &self.options,
                );
                match cancellable(&ctx.cancellation, call).await {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        let kind = ErrorKind::CollaboratorUnavailable;
                        return e.into_step_failure("query validator", kind).into();
                    }
                }
            }
        };

        let mut next = state.clone();
        next.query_validation = Some(verdict);
        StepResult::proceed(next)
    }
}

/// Executes the accepted query against the query backend.
pub struct QueryRunner {
    backend: Arc<dyn QueryBackend>,
}

impl QueryRunner {
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Step for QueryRunner {
    fn name(&self) -> &str {
        "query-runner"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let accepted = state.query_validation.as_ref().is_some_and(|v| v.accepted);
        let Some(query) = state.candidate_query.as_deref().filter(|_| accepted) else {
            return StepFailure::invariant("executing a query without an accepting verdict").into();
        };

        let rows = match cancellable(&ctx.cancellation, self.backend.execute(query)).await {
            Ok(rows) => rows,
            Err(e) => {
                return e.into_step_failure("query backend", ErrorKind::ExecutionFailed).into()
            }
        };

        log::debug!("{}: query returned {} rows", ctx.request_id, rows.row_count());
        let mut next = state.clone();
        next.execution_result = Some(rows);
        StepResult::proceed(next)
    }
}
