//! Planning and routing
//!
//! The planner asks the model for a structured [`Plan`] once per run. The
//! router turns the plan's route into the graph's branch decision.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_engine::collaborators::extract_typed;
use pipeline_engine::{
    CompletionOptions, ErrorKind, ExtractionService, Plan, Route, Stage, Step, StepContext,
    StepFailure, StepResult, WorkflowState,
};

use crate::cancellable;
use crate::prompts;

/// Produces the run's [`Plan`] through structured extraction.
pub struct Planner {
    extraction: Arc<dyn ExtractionService>,
    options: CompletionOptions,
}

impl Planner {
    pub fn new(extraction: Arc<dyn ExtractionService>, options: CompletionOptions) -> Self {
        Self { extraction, options }
    }
}

#[async_trait]
impl Step for Planner {
    fn name(&self) -> &str {
        "planner"
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        let prompt = prompts::planning_prompt(state);
        let schema = prompts::plan_schema();
        let plan: Plan = match cancellable(
            &ctx.cancellation,
            extract_typed(self.extraction.as_ref(), &prompt, &schema, &self.options),
        )
        .await
        {
            Ok(plan) => plan,
            Err(e) => return e.into_step_failure("planner", ErrorKind::GenerationFailed).into(),
        };

        log::debug!("{}: planned route {:?}: {}", ctx.request_id, plan.route, plan.summary);
        let mut next = state.clone();
        next.plan = Some(plan);
        StepResult::proceed(next)
    }
}

/// Copies the plan's route into the state and names the next stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanRouter;

impl PlanRouter {
    pub fn new() -> Self {
        Self
    }

    fn stage_for(route: Route) -> Stage {
        match route {
            Route::Query => Stage::GeneratingQuery,
            Route::DirectAnswer => Stage::Responding,
        }
    }
}

#[async_trait]
impl Step for PlanRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn run(&self, state: &WorkflowState, _ctx: &StepContext) -> StepResult {
        let Some(plan) = &state.plan else {
            return StepFailure::invariant("routing reached without a plan").into();
        };
        let route = plan.route;
        let mut next = state.clone();
        next.route = Some(route);
        StepResult::proceed_to(next, Self::stage_for(route))
    }
}
