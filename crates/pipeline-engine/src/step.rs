//! The contract every pipeline stage implements.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, StepFailure};
use crate::state::{RequestId, Stage, WorkflowState};

/// Per-invocation input handed to a step alongside the state.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub request_id: RequestId,
    /// Attempt number within a retry loop, starting at 1.
    pub attempt: u32,
    /// Rejection reasons of earlier attempts, oldest first.
    pub feedback: Vec<String>,
    /// Run cancellation. Steps pass it to collaborators that can abort
    /// in-flight calls; the engine checks it around every step anyway.
    pub cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(request_id: RequestId, cancellation: CancellationToken) -> Self {
        Self {
            request_id,
            attempt: 1,
            feedback: Vec::new(),
            cancellation,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// Output of a step.
#[derive(Debug, Clone)]
pub enum StepResult {
    /// The step produced an updated state. `next` optionally names the
    /// stage the step expects to follow; the graph rejects hints that do
    /// not match its transition table.
    Continue {
        state: WorkflowState,
        next: Option<Stage>,
    },
    Fail(StepFailure),
}

impl StepResult {
    pub fn proceed(state: WorkflowState) -> Self {
        Self::Continue { state, next: None }
    }

    pub fn proceed_to(state: WorkflowState, next: Stage) -> Self {
        Self::Continue {
            state,
            next: Some(next),
        }
    }

    pub fn fail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Fail(StepFailure::new(kind, detail))
    }
}

impl From<StepFailure> for StepResult {
    fn from(failure: StepFailure) -> Self {
        Self::Fail(failure)
    }
}

/// A pipeline stage.
///
/// Implementations receive the state by reference and return a new value;
/// they never retain the state or the result after returning.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult;
}

/// A step backed by a synchronous closure, for stages that need no I/O.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn(&WorkflowState, &StepContext) -> StepResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&WorkflowState, &StepContext) -> StepResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
        (self.f)(state, ctx)
    }
}
