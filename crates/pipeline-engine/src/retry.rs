//! Bounded generate/validate retry loops.
//!
//! A [`RetryLoop`] runs a generator step and a validator step as a pair.
//! Each rejected attempt bumps the generator stage's retry counter, emits a
//! `retrying` event, and feeds the rejection reason into the next
//! generation through [`StepContext::feedback`](crate::step::StepContext).
//! When the counter reaches the policy's `max_attempts` the policy's
//! [`ExhaustionAction`] decides between failing the run and proceeding with
//! the last, unvalidated artifact.

use serde::{Deserialize, Serialize};

use crate::driver::RunDriver;
use crate::error::{ErrorKind, StepFailure};
use crate::events::EventKind;
use crate::state::{Stage, Verdict, WorkflowState};
use crate::step::Step;
use crate::transitions::{next_stage, LoopVerdict, Signal};

/// Reason recorded when the validator itself could not be reached.
pub const VALIDATOR_UNAVAILABLE: &str = "validator unavailable";

/// What to do once every attempt has been rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionAction {
    /// Fail the run with `ValidationExhausted`.
    AbortRun,
    /// Continue with the last artifact, marked unvalidated.
    ProceedWithBestEffort,
}

/// Retry configuration for one generate/validate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub on_exhaustion: ExhaustionAction,
}

impl RetryPolicy {
    /// Create a policy. At least one attempt is always made.
    pub fn new(max_attempts: u32, on_exhaustion: ExhaustionAction) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            on_exhaustion,
        }
    }

    /// Three attempts, then fail: an invalid query must never execute.
    pub fn query_validation() -> Self {
        Self::new(3, ExhaustionAction::AbortRun)
    }

    /// Two attempts, then answer with the unvalidated interpretation.
    pub fn interpretation_validation() -> Self {
        Self::new(2, ExhaustionAction::ProceedWithBestEffort)
    }
}

/// The artifact a loop generates and validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Query,
    Interpretation,
}

impl LoopKind {
    pub fn generate_stage(&self) -> Stage {
        match self {
            LoopKind::Query => Stage::GeneratingQuery,
            LoopKind::Interpretation => Stage::Interpreting,
        }
    }

    pub fn validate_stage(&self) -> Stage {
        match self {
            LoopKind::Query => Stage::ValidatingQuery,
            LoopKind::Interpretation => Stage::ValidatingInterpretation,
        }
    }

    fn artifact_name(&self) -> &'static str {
        match self {
            LoopKind::Query => "query",
            LoopKind::Interpretation => "interpretation",
        }
    }

    fn has_artifact(&self, state: &WorkflowState) -> bool {
        match self {
            LoopKind::Query => state.candidate_query.is_some(),
            LoopKind::Interpretation => state.interpretation.is_some(),
        }
    }

    fn verdict_slot<'s>(&self, state: &'s mut WorkflowState) -> &'s mut Option<Verdict> {
        match self {
            LoopKind::Query => &mut state.query_validation,
            LoopKind::Interpretation => &mut state.interpretation_validation,
        }
    }

    fn mark_validated(&self, state: &mut WorkflowState, validated: bool) {
        if let (LoopKind::Interpretation, Some(interpretation)) =
            (self, state.interpretation.as_mut())
        {
            interpretation.validated = validated;
        }
    }
}

/// How a retry loop ended when the run may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Accepted { attempts: u32 },
    BestEffort { attempts: u32 },
}

impl LoopExit {
    pub fn attempts(&self) -> u32 {
        match self {
            LoopExit::Accepted { attempts } | LoopExit::BestEffort { attempts } => *attempts,
        }
    }

    pub(crate) fn verdict(&self) -> LoopVerdict {
        match self {
            LoopExit::Accepted { .. } => LoopVerdict::Accepted,
            LoopExit::BestEffort { .. } => {
                LoopVerdict::Exhausted(ExhaustionAction::ProceedWithBestEffort)
            }
        }
    }
}

/// Why the previous attempt did not produce an accepted artifact.
struct Rejection {
    stage: Stage,
    reason: String,
    /// The generator failed, as opposed to the validator rejecting.
    generation_failed: bool,
}

/// A generator/validator pair governed by a [`RetryPolicy`].
pub struct RetryLoop<'a> {
    kind: LoopKind,
    generator: &'a dyn Step,
    validator: &'a dyn Step,
    policy: RetryPolicy,
}

impl<'a> RetryLoop<'a> {
    pub fn new(
        kind: LoopKind,
        generator: &'a dyn Step,
        validator: &'a dyn Step,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            kind,
            generator,
            validator,
            policy,
        }
    }

    /// Run attempts until one is accepted or the policy is exhausted.
    ///
    /// On return `state` is positioned at the stage the loop ended in, which
    /// is the stage the graph transitions out of.
    pub(crate) async fn run(
        &self,
        state: &mut WorkflowState,
        driver: &mut RunDriver<'_>,
    ) -> Result<LoopExit, StepFailure> {
        let generate_stage = self.kind.generate_stage();
        let mut feedback: Vec<String> = Vec::new();

        loop {
            let attempt = state.retry_count(generate_stage) + 1;
            let rejection = match self.attempt(state, driver, attempt, &feedback).await? {
                None => {
                    self.kind.mark_validated(state, true);
                    return Ok(LoopExit::Accepted { attempts: attempt });
                }
                Some(rejection) => rejection,
            };

            let rejected = state.record_retry(generate_stage);
            let verdict = if rejected >= self.policy.max_attempts {
                LoopVerdict::Exhausted(self.policy.on_exhaustion)
            } else {
                LoopVerdict::Retry
            };
            let next = next_stage(rejection.stage, Signal::Verdict(verdict))?;

            match verdict {
                LoopVerdict::Retry => {
                    log::warn!(
                        "{}: {} attempt {}/{} rejected: {}",
                        driver.request_id(),
                        self.kind.artifact_name(),
                        attempt,
                        self.policy.max_attempts,
                        rejection.reason
                    );
                    driver
                        .report(
                            rejection.stage,
                            EventKind::Retrying,
                            format!(
                                "Attempt {} of {} rejected: {}",
                                attempt, self.policy.max_attempts, rejection.reason
                            ),
                        )
                        .await;
                    feedback.push(rejection.reason);
                    state.enter(next);
                }
                LoopVerdict::Exhausted(action) => {
                    return self.exhausted(state, driver, action, rejection, attempt, next).await;
                }
                LoopVerdict::Accepted => {
                    return Err(StepFailure::invariant(
                        "rejected attempt produced an accepting verdict",
                    ))
                }
            }
        }
    }

    /// One generate + validate attempt. `None` means accepted.
    async fn attempt(
        &self,
        state: &mut WorkflowState,
        driver: &mut RunDriver<'_>,
        attempt: u32,
        feedback: &[String],
    ) -> Result<Option<Rejection>, StepFailure> {
        let generate_stage = self.kind.generate_stage();
        let validate_stage = self.kind.validate_stage();

        state.enter(generate_stage);
        let ctx = driver.context(attempt, feedback.to_vec());
        match driver.invoke(generate_stage, self.generator, state, ctx).await {
            Ok((next, hint)) => {
                let expected = next_stage(generate_stage, Signal::Completed)?;
                check_hint(self.generator, generate_stage, hint, &[expected])?;
                *state = next;
            }
            Err(failure) if !failure.is_retryable() => return Err(failure),
            Err(failure) => {
                return Ok(Some(Rejection {
                    stage: generate_stage,
                    reason: failure.detail,
                    generation_failed: true,
                }))
            }
        }
        if !self.kind.has_artifact(state) {
            return Err(StepFailure::invariant(format!(
                "generator '{}' produced no {}",
                self.generator.name(),
                self.kind.artifact_name()
            )));
        }
        driver
            .report(
                generate_stage,
                EventKind::Succeeded,
                format!("Generated {}", self.kind.artifact_name()),
            )
            .await;

        state.enter(validate_stage);
        *self.kind.verdict_slot(state) = None;
        let ctx = driver.context(attempt, feedback.to_vec());
        let verdict = match driver.invoke(validate_stage, self.validator, state, ctx).await {
            Ok((next, hint)) => {
                *state = next;
                let verdict = self.kind.verdict_slot(state).take().ok_or_else(|| {
                    StepFailure::invariant(format!(
                        "validator '{}' returned no verdict",
                        self.validator.name()
                    ))
                })?;
                let allowed = if verdict.accepted {
                    vec![next_stage(validate_stage, Signal::Verdict(LoopVerdict::Accepted))?]
                } else {
                    vec![
                        next_stage(validate_stage, Signal::Verdict(LoopVerdict::Retry))?,
                        next_stage(
                            validate_stage,
                            Signal::Verdict(LoopVerdict::Exhausted(self.policy.on_exhaustion)),
                        )?,
                    ]
                };
                check_hint(self.validator, validate_stage, hint, &allowed)?;
                verdict
            }
            Err(failure) if !failure.is_retryable() => return Err(failure),
            Err(failure) => {
                log::warn!(
                    "{}: validator '{}' unavailable: {}",
                    driver.request_id(),
                    self.validator.name(),
                    failure
                );
                Verdict::reject(VALIDATOR_UNAVAILABLE)
            }
        };

        let verdict = Verdict { attempt, ..verdict };
        *self.kind.verdict_slot(state) = Some(verdict.clone());

        if verdict.accepted {
            driver
                .report(validate_stage, EventKind::Succeeded, verdict.reason)
                .await;
            Ok(None)
        } else {
            Ok(Some(Rejection {
                stage: validate_stage,
                reason: verdict.reason,
                generation_failed: false,
            }))
        }
    }

    async fn exhausted(
        &self,
        state: &mut WorkflowState,
        driver: &mut RunDriver<'_>,
        action: ExhaustionAction,
        rejection: Rejection,
        attempts: u32,
        next: Stage,
    ) -> Result<LoopExit, StepFailure> {
        let artifact = self.kind.artifact_name();
        let salvageable = next != Stage::Failed && self.kind.has_artifact(state);

        if action == ExhaustionAction::ProceedWithBestEffort && salvageable {
            log::warn!(
                "{}: {} not accepted after {} attempts, proceeding unvalidated",
                driver.request_id(),
                artifact,
                attempts
            );
            self.kind.mark_validated(state, false);
            driver
                .report(
                    rejection.stage,
                    EventKind::Succeeded,
                    format!("Proceeding with unvalidated {}: {}", artifact, rejection.reason),
                )
                .await;
            return Ok(LoopExit::BestEffort { attempts });
        }

        if rejection.generation_failed || !self.kind.has_artifact(state) {
            Err(StepFailure::new(
                ErrorKind::GenerationFailed,
                format!(
                    "Could not generate a {} after {} attempts: {}",
                    artifact, attempts, rejection.reason
                ),
            ))
        } else {
            Err(StepFailure::new(
                ErrorKind::ValidationExhausted,
                format!(
                    "The {} was rejected {} times: {}",
                    artifact, attempts, rejection.reason
                ),
            ))
        }
    }
}

/// A loop step's hint must name a stage its own result can lead to.
fn check_hint(
    step: &dyn Step,
    stage: Stage,
    hint: Option<Stage>,
    allowed: &[Stage],
) -> Result<(), StepFailure> {
    match hint {
        Some(hint) if !allowed.contains(&hint) => Err(StepFailure::invariant(format!(
            "step '{}' hinted {} but the graph moves from {} to {:?}",
            step.name(),
            hint,
            stage,
            allowed
        ))),
        _ => Ok(()),
    }
}
