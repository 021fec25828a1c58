//! Response assembly

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_engine::{
    CompletionOptions, CompletionService, ErrorKind, ResponsePayload, Route, Step, StepContext,
    StepFailure, StepResult, WorkflowState,
};

use crate::cancellable;
use crate::prompts;

/// Builds the [`ResponsePayload`] returned to the client.
///
/// Query-routed runs answer with the interpretation and report the query
/// and row count alongside it. Direct-answer runs ask the model directly.
pub struct Responder {
    completion: Arc<dyn CompletionService>,
    options: CompletionOptions,
}

impl Responder {
    pub fn new(completion: Arc<dyn CompletionService>, options: CompletionOptions) -> Self {
        Self { completion, options }
    }

    fn from_interpretation(state: &WorkflowState) -> Result<ResponsePayload, StepFailure> {
        let interpretation = state.interpretation.as_ref().ok_or_else(|| {
            StepFailure::invariant("responding to a query run without an interpretation")
        })?;
        Ok(ResponsePayload {
            answer: interpretation.text.clone(),
            route: Route::Query,
            query: state.candidate_query.clone(),
            row_count: state.execution_result.as_ref().map(|rows| rows.row_count()),
            validated: interpretation.validated,
        })
    }
}

#[async_trait]
impl Step for Responder {
    fn name(&self) -> &str {
        "responder"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let payload = match state.route {
            Some(Route::Query) => match Self::from_interpretation(state) {
                Ok(payload) => payload,
                Err(failure) => return failure.into(),
            },
            Some(Route::DirectAnswer) => {
                let prompt = prompts::direct_answer_prompt(state);
                let call = self.completion.complete(&prompt, &self.options);
                let answer = match cancellable(&ctx.cancellation, call).await {
                    Ok(answer) => answer.trim().to_string(),
                    Err(e) => {
                        return e.into_step_failure("responder", ErrorKind::GenerationFailed).into()
                    }
                };
                if answer.is_empty() {
                    return StepResult::fail(
                        ErrorKind::GenerationFailed,
                        "The responder returned an empty answer",
                    );
                }
                ResponsePayload {
                    answer,
                    route: Route::DirectAnswer,
                    query: None,
                    row_count: None,
                    validated: true,
                }
            }
            None => return StepFailure::invariant("responding without a route").into(),
        };

        let mut next = state.clone();
        next.response = Some(payload);
        StepResult::proceed(next)
    }
}
