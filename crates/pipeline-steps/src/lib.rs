//! Pipeline Steps
//!
//! Default step implementations for the Sightline question pipeline.
//! Each step is one stage of the workflow graph and reaches the outside
//! world only through the collaborator traits of `pipeline-engine`.
//!
//! # Stages
//!
//! - **Planning**: `Planner` and `PlanRouter` decide whether a query is needed
//! - **Query**: `QueryGenerator`, `QueryValidator` and `QueryRunner`
//! - **Interpretation**: `Interpreter` and `InterpretationValidator`
//! - **Response**: `Responder` builds the payload returned to the client

pub mod interpretation;
pub mod planning;
pub mod prompts;
pub mod query;
pub mod respond;
pub mod setup;

pub use interpretation::{InterpretationValidator, Interpreter};
pub use planning::{PlanRouter, Planner};
pub use query::{QueryGenerator, QueryRunner, QueryValidator};
pub use respond::Responder;
pub use setup::{default_steps, StepCollaborators};

use std::future::Future;

use pipeline_engine::{CancellationToken, CollaboratorError};

/// Await a collaborator call, abandoning it if the run is cancelled.
pub(crate) async fn cancellable<T, F>(
    token: &CancellationToken,
    call: F,
) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(CollaboratorError::Cancelled),
        result = call => result,
    }
}
