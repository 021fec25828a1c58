//! The fixed question-answering workflow graph.
//!
//! [`WorkflowGraph`] walks a [`WorkflowState`] from `Planning` to `Done` or
//! `Failed`, invoking one step per stage and delegating the two
//! generate/validate pairs to [`RetryLoop`]s. Every transition goes through
//! [`next_stage`], so the graph cannot take an edge the table does not have.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::driver::RunDriver;
use crate::error::{ErrorKind, StepFailure};
use crate::events::{EventKind, ProgressEmitter};
use crate::retry::{LoopKind, RetryLoop, RetryPolicy};
use crate::state::{FailureDescriptor, Route, Stage, TerminalOutcome, WorkflowState};
use crate::step::Step;
use crate::transitions::{next_stage, Signal};

/// The step implementation bound to each stage.
#[derive(Clone)]
pub struct WorkflowSteps {
    pub planner: Arc<dyn Step>,
    pub router: Arc<dyn Step>,
    pub query_generator: Arc<dyn Step>,
    pub query_validator: Arc<dyn Step>,
    pub query_executor: Arc<dyn Step>,
    pub interpreter: Arc<dyn Step>,
    pub interpretation_validator: Arc<dyn Step>,
    pub responder: Arc<dyn Step>,
}

/// Executor for the question-answering workflow.
#[derive(Clone)]
pub struct WorkflowGraph {
    steps: WorkflowSteps,
    query_policy: RetryPolicy,
    interpretation_policy: RetryPolicy,
}

impl WorkflowGraph {
    /// Create a graph with the default retry policies.
    pub fn new(steps: WorkflowSteps) -> Self {
        Self {
            steps,
            query_policy: RetryPolicy::query_validation(),
            interpretation_policy: RetryPolicy::interpretation_validation(),
        }
    }

    /// Set the policy of the query generate/validate loop.
    pub fn with_query_policy(mut self, policy: RetryPolicy) -> Self {
        self.query_policy = policy;
        self
    }

    /// Set the policy of the interpretation generate/validate loop.
    pub fn with_interpretation_policy(mut self, policy: RetryPolicy) -> Self {
        self.interpretation_policy = policy;
        self
    }

    pub fn query_policy(&self) -> RetryPolicy {
        self.query_policy
    }

    pub fn interpretation_policy(&self) -> RetryPolicy {
        self.interpretation_policy
    }

    /// Run to completion and emit the final event.
    pub async fn execute(
        &self,
        state: WorkflowState,
        mut emitter: ProgressEmitter,
        cancellation: &CancellationToken,
    ) -> WorkflowState {
        let state = self.drive(state, &mut emitter, cancellation).await;
        if let Some(outcome) = state.terminal_outcome().cloned() {
            if emitter.finish(outcome).await.is_err() {
                log::debug!("{}: final event had no consumer", state.request_id());
            }
        }
        state
    }

    /// Run to a terminal stage without emitting the final event.
    ///
    /// The returned state always carries a terminal outcome. Callers that
    /// need to do work between the end of the graph and the final event
    /// (recording history, for one) use this and call
    /// [`ProgressEmitter::finish`] themselves.
    pub async fn drive(
        &self,
        mut state: WorkflowState,
        emitter: &mut ProgressEmitter,
        cancellation: &CancellationToken,
    ) -> WorkflowState {
        let mut driver = RunDriver::new(emitter, cancellation.clone());
        if let Err(failure) = self.walk(&mut state, &mut driver).await {
            let stage = state.current_stage();
            if failure.kind != ErrorKind::Cancelled {
                driver
                    .report(stage, EventKind::Failed, failure.detail.clone())
                    .await;
            }
            log::info!(
                "{}: run failed in {} ({})",
                state.request_id(),
                stage,
                failure.kind
            );
            let descriptor = FailureDescriptor {
                error_kind: failure.kind,
                detail: failure.detail,
                stage,
            };
            if let Err(err) = state.finish(TerminalOutcome::Failure(descriptor)) {
                log::error!("{}: {}", state.request_id(), err);
                state.force_failure(FailureDescriptor {
                    error_kind: ErrorKind::InternalInvariantViolation,
                    detail: "The request failed unexpectedly".to_string(),
                    stage,
                });
            }
        }
        state
    }

    async fn walk(
        &self,
        state: &mut WorkflowState,
        driver: &mut RunDriver<'_>,
    ) -> Result<(), StepFailure> {
        let mut stage = Stage::Planning;
        loop {
            state.enter(stage);
            let (signal, hint, summary) = match stage {
                Stage::Planning => {
                    let hint = self.single(stage, &*self.steps.planner, state, driver).await?;
                    let plan = state
                        .plan
                        .as_ref()
                        .ok_or_else(|| StepFailure::invariant("planner produced no plan"))?;
                    (Signal::Completed, hint, plan.summary.clone())
                }
                Stage::Routing => {
                    let hint = self.single(stage, &*self.steps.router, state, driver).await?;
                    let route = state
                        .route
                        .ok_or_else(|| StepFailure::invariant("router produced no route"))?;
                    let summary = match route {
                        Route::Query => "Answering with a query",
                        Route::DirectAnswer => "Answering directly",
                    };
                    (Signal::Routed(route), hint, summary.to_string())
                }
                Stage::GeneratingQuery => {
                    let exit = RetryLoop::new(
                        LoopKind::Query,
                        &*self.steps.query_generator,
                        &*self.steps.query_validator,
                        self.query_policy,
                    )
                    .run(state, driver)
                    .await?;
                    (Signal::Verdict(exit.verdict()), None, String::new())
                }
                Stage::ExecutingQuery => {
                    let hint = self
                        .single(stage, &*self.steps.query_executor, state, driver)
                        .await?;
                    let rows = state.execution_result.as_ref().ok_or_else(|| {
                        StepFailure::invariant("query executor produced no result")
                    })?;
                    (Signal::Completed, hint, format!("{} rows returned", rows.row_count()))
                }
                Stage::Interpreting => {
                    let exit = RetryLoop::new(
                        LoopKind::Interpretation,
                        &*self.steps.interpreter,
                        &*self.steps.interpretation_validator,
                        self.interpretation_policy,
                    )
                    .run(state, driver)
                    .await?;
                    (Signal::Verdict(exit.verdict()), None, String::new())
                }
                Stage::Responding => {
                    let hint = self.single(stage, &*self.steps.responder, state, driver).await?;
                    if state.response.is_none() {
                        return Err(StepFailure::invariant("responder produced no response"));
                    }
                    (Signal::Completed, hint, "Response ready".to_string())
                }
                Stage::Done => {
                    let response = state
                        .response
                        .clone()
                        .ok_or_else(|| StepFailure::invariant("reached Done without a response"))?;
                    state.finish(TerminalOutcome::Success(response))?;
                    log::info!("{}: run completed", state.request_id());
                    return Ok(());
                }
                Stage::ValidatingQuery | Stage::ValidatingInterpretation | Stage::Failed => {
                    return Err(StepFailure::invariant(format!(
                        "{} cannot be entered directly",
                        stage
                    )));
                }
            };

            // Retry loops may end in their validation stage.
            let from = state.current_stage();
            let next = next_stage(from, signal)?;
            if let Some(hint) = hint {
                if hint != next {
                    return Err(StepFailure::invariant(format!(
                        "step hinted {} but the graph moves from {} to {}",
                        hint, from, next
                    )));
                }
            }
            if next == Stage::Failed {
                return Err(StepFailure::invariant(format!(
                    "{} moved to Failed without a failure",
                    from
                )));
            }
            if !summary.is_empty() {
                driver.report(from, EventKind::Succeeded, summary).await;
            }
            log::debug!("{}: {} -> {}", state.request_id(), from, next);
            stage = next;
        }
    }

    /// Invoke a stage that is not part of a retry loop.
    async fn single(
        &self,
        stage: Stage,
        step: &dyn Step,
        state: &mut WorkflowState,
        driver: &mut RunDriver<'_>,
    ) -> Result<Option<Stage>, StepFailure> {
        let ctx = driver.context(1, Vec::new());
        let (next, hint) = driver.invoke(stage, step, state, ctx).await?;
        *state = next;
        Ok(hint)
    }
}
