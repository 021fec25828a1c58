//! Result interpretation and its review

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_engine::collaborators::extract_typed;
use pipeline_engine::{
    CompletionOptions, CompletionService, ErrorKind, ExtractionService, Interpretation, QueryRows,
    Step, StepContext, StepFailure, StepResult, Verdict, WorkflowState,
};

use crate::cancellable;
use crate::prompts::{self, DEFAULT_PREVIEW_ROWS};

fn rows_of(state: &WorkflowState) -> Result<&QueryRows, StepFailure> {
    state
        .execution_result
        .as_ref()
        .ok_or_else(|| StepFailure::invariant("interpreting without an execution result"))
}

/// Reads the query result back into a natural-language answer.
pub struct Interpreter {
    completion: Arc<dyn CompletionService>,
    options: CompletionOptions,
    preview_rows: usize,
}

impl Interpreter {
    pub fn new(completion: Arc<dyn CompletionService>, options: CompletionOptions) -> Self {
        Self {
            completion,
            options,
            preview_rows: DEFAULT_PREVIEW_ROWS,
        }
    }

    /// Set how many rows are shown to the model.
    pub fn with_preview_rows(mut self, preview_rows: usize) -> Self {
        self.preview_rows = preview_rows;
        self
    }
}

#[async_trait]
impl Step for Interpreter {
    fn name(&self) -> &str {
        "interpreter"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let rows = match rows_of(state) {
            Ok(rows) => rows,
            Err(failure) => return failure.into(),
        };
        let prompt = prompts::interpretation_prompt(state, rows, self.preview_rows, &ctx.feedback);
        let call = self.completion.complete(&prompt, &self.options);
        let reply = match cancellable(&ctx.cancellation, call).await {
            Ok(reply) => reply,
            Err(e) => return e.into_step_failure("interpreter", ErrorKind::GenerationFailed).into(),
        };

        let text = reply.trim();
        if text.is_empty() {
            return StepResult::fail(
                ErrorKind::GenerationFailed,
                "The interpreter returned an empty answer",
            );
        }

        let mut next = state.clone();
        next.interpretation = Some(Interpretation::new(text));
        StepResult::proceed(next)
    }
}

/// Asks the model whether the interpretation is supported by the rows.
pub struct InterpretationValidator {
    extraction: Arc<dyn ExtractionService>,
    options: CompletionOptions,
    preview_rows: usize,
}

impl InterpretationValidator {
    pub fn new(extraction: Arc<dyn ExtractionService>, options: CompletionOptions) -> Self {
        Self {
            extraction,
            options,
            preview_rows: DEFAULT_PREVIEW_ROWS,
        }
    }

    pub fn with_preview_rows(mut self, preview_rows: usize) -> Self {
        self.preview_rows = preview_rows;
        self
    }
}

#[async_trait]
impl Step for InterpretationValidator {
    fn name(&self) -> &str {
        "interpretation-validator"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let rows = match rows_of(state) {
            Ok(rows) => rows,
            Err(failure) => return failure.into(),
        };
        let Some(interpretation) = &state.interpretation else {
            return StepFailure::invariant("validating without an interpretation").into();
        };

        let prompt = prompts::interpretation_review_prompt(
            state,
            rows,
            &interpretation.text,
            self.preview_rows,
        );
        let schema = prompts::verdict_schema();
        let verdict: Verdict = match cancellable(
            &ctx.cancellation,
            extract_typed(self.extraction.as_ref(), &prompt, &schema, &self.options),
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                let kind = ErrorKind::CollaboratorUnavailable;
                return e.into_step_failure("interpretation validator", kind).into();
            }
        };

        let mut next = state.clone();
        next.interpretation_validation = Some(verdict);
        StepResult::proceed(next)
    }
}
