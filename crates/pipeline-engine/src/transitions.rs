//! The workflow graph's transition table.
//!
//! ```text
//! Planning -> Routing -> GeneratingQuery <-> ValidatingQuery -> ExecutingQuery
//!                 |                                                  |
//!                 |            Interpreting <-> ValidatingInterpretation
//!                 |                                  |
//!                 +--------------------------> Responding -> Done
//! ```
//!
//! Any non-terminal stage may move to `Failed`. The only cycles are the two
//! retry pairs.

use crate::error::{EngineError, Result};
use crate::retry::ExhaustionAction;
use crate::state::{Route, Stage};

/// Outcome of one retry-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Accepted,
    Retry,
    Exhausted(ExhaustionAction),
}

/// What happened in the stage being left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Completed,
    Routed(Route),
    Verdict(LoopVerdict),
    Failed,
}

/// Compute the stage that follows `from` given `signal`.
pub fn next_stage(from: Stage, signal: Signal) -> Result<Stage> {
    use ExhaustionAction::{AbortRun, ProceedWithBestEffort};
    use LoopVerdict::{Accepted, Exhausted, Retry};
    use Stage::*;

    let next = match (from, signal) {
        (Done | Failed, _) => {
            return Err(EngineError::invariant(format!(
                "no transition leaves terminal stage {}",
                from
            )))
        }
        (_, Signal::Failed) => Failed,

        (Planning, Signal::Completed) => Routing,
        (Routing, Signal::Routed(Route::Query)) => GeneratingQuery,
        (Routing, Signal::Routed(Route::DirectAnswer)) => Responding,

        (GeneratingQuery, Signal::Completed) => ValidatingQuery,
        (GeneratingQuery | ValidatingQuery, Signal::Verdict(Retry)) => GeneratingQuery,
        (ValidatingQuery, Signal::Verdict(Accepted)) => ExecutingQuery,
        // An unaccepted query never executes, whatever the policy says.
        (GeneratingQuery | ValidatingQuery, Signal::Verdict(Exhausted(_))) => Failed,

        (ExecutingQuery, Signal::Completed) => Interpreting,

        (Interpreting, Signal::Completed) => ValidatingInterpretation,
        (Interpreting | ValidatingInterpretation, Signal::Verdict(Retry)) => Interpreting,
        (ValidatingInterpretation, Signal::Verdict(Accepted)) => Responding,
        (
            Interpreting | ValidatingInterpretation,
            Signal::Verdict(Exhausted(ProceedWithBestEffort)),
        ) => Responding,
        (Interpreting | ValidatingInterpretation, Signal::Verdict(Exhausted(AbortRun))) => Failed,

        (Responding, Signal::Completed) => Done,

        (from, signal) => {
            return Err(EngineError::invariant(format!(
                "no transition from {} on {:?}",
                from, signal
            )))
        }
    };
    Ok(next)
}

/// Stages a step may name as its `next` hint when leaving `stage`.
pub fn successors(stage: Stage) -> &'static [Stage] {
    match stage {
        Stage::Planning => &[Stage::Routing],
        Stage::Routing => &[Stage::GeneratingQuery, Stage::Responding],
        Stage::GeneratingQuery => &[Stage::ValidatingQuery],
        Stage::ValidatingQuery => &[Stage::ExecutingQuery, Stage::GeneratingQuery],
        Stage::ExecutingQuery => &[Stage::Interpreting],
        Stage::Interpreting => &[Stage::ValidatingInterpretation],
        Stage::ValidatingInterpretation => &[Stage::Responding, Stage::Interpreting],
        Stage::Responding => &[Stage::Done],
        Stage::Done | Stage::Failed => &[],
    }
}
