//! Step invocation with cancellation checkpoints and progress reporting.

use tokio_util::sync::CancellationToken;

use crate::error::StepFailure;
use crate::events::{EventKind, ProgressEmitter};
use crate::state::{RequestId, Stage, WorkflowState};
use crate::step::{Step, StepContext, StepResult};
use crate::transitions::successors;

/// Drives individual steps for one run.
///
/// Every invocation emits a `started` event, then checks cancellation
/// before calling the step and again after it returns.
pub(crate) struct RunDriver<'a> {
    emitter: &'a mut ProgressEmitter,
    cancellation: CancellationToken,
}

impl<'a> RunDriver<'a> {
    pub(crate) fn new(emitter: &'a mut ProgressEmitter, cancellation: CancellationToken) -> Self {
        Self {
            emitter,
            cancellation,
        }
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.emitter.request_id()
    }

    pub(crate) fn context(&self, attempt: u32, feedback: Vec<String>) -> StepContext {
        StepContext {
            request_id: self.request_id(),
            attempt,
            feedback,
            cancellation: self.cancellation.clone(),
        }
    }

    /// Fail with `Cancelled` if the run has been cancelled.
    pub(crate) fn checkpoint(&self) -> Result<(), StepFailure> {
        if self.cancellation.is_cancelled() {
            Err(StepFailure::cancelled())
        } else {
            Ok(())
        }
    }

    /// Emit a progress event. A consumer that has gone away cancels the run.
    pub(crate) async fn report(
        &mut self,
        stage: Stage,
        kind: EventKind,
        message: impl Into<String>,
    ) {
        if self.emitter.emit(stage, kind, message).await.is_err() {
            log::warn!(
                "{}: progress consumer disconnected, cancelling run",
                self.request_id()
            );
            self.cancellation.cancel();
        }
    }

    /// Run `step` for `stage` and return its updated state and stage hint.
    pub(crate) async fn invoke(
        &mut self,
        stage: Stage,
        step: &dyn Step,
        state: &WorkflowState,
        ctx: StepContext,
    ) -> Result<(WorkflowState, Option<Stage>), StepFailure> {
        let started = if ctx.is_retry() {
            format!("{} (attempt {})", stage.label(), ctx.attempt)
        } else {
            stage.label().to_string()
        };
        self.report(stage, EventKind::Started, started).await;
        self.checkpoint()?;

        log::debug!(
            "{}: running step '{}' for {} (attempt {})",
            ctx.request_id,
            step.name(),
            stage,
            ctx.attempt
        );
        let result = step.run(state, &ctx).await;
        self.checkpoint()?;

        match result {
            StepResult::Continue { state: next, next: hint } => {
                state.check_successor(&next)?;
                if let Some(hint) = hint {
                    if !successors(stage).contains(&hint) {
                        return Err(StepFailure::invariant(format!(
                            "step '{}' hinted {} after {}",
                            step.name(),
                            hint,
                            stage
                        )));
                    }
                }
                Ok((next, hint))
            }
            StepResult::Fail(failure) => {
                log::debug!(
                    "{}: step '{}' failed: {}",
                    ctx.request_id,
                    step.name(),
                    failure
                );
                Err(failure)
            }
        }
    }
}
