//! Pipeline Engine - Workflow execution for Sightline question pipelines
//!
//! This crate turns a natural-language analytics question into an answer by
//! walking a fixed workflow graph of steps. It provides:
//!
//! - The step contract every stage implements
//! - Bounded generate/validate retry loops with configurable exhaustion
//! - An ordered, back-pressured progress event stream per run
//! - Cooperative cancellation checked around every step
//!
//! # Architecture
//!
//! - `WorkflowGraph`: Drives a `WorkflowState` from `Planning` to a terminal stage
//! - `RetryLoop`: Runs a generator/validator pair under a `RetryPolicy`
//! - `ProgressEmitter`/`ProgressStream`: Producer and consumer of `ProgressEvent`s
//! - `collaborators`: Traits for the LLM, query backend and history store
//!
//! # Example
//!
//! ```ignore
//! use pipeline_engine::{progress_channel, RequestId, WorkflowGraph, WorkflowState};
//!
//! let graph = WorkflowGraph::new(steps);
//! let request_id = RequestId::new();
//! let (emitter, mut events) = progress_channel(request_id, 64);
//! let state = WorkflowState::new(request_id, "user", "session", "How many orders shipped?");
//! tokio::spawn(async move { graph.execute(state, emitter, &token).await });
//! while let Some(event) = events.next_event().await { /* ... */ }
//! ```

pub mod collaborators;
mod driver;
pub mod error;
pub mod events;
pub mod graph;
pub mod retry;
pub mod state;
pub mod step;
pub mod transitions;

// Re-export key types
pub use collaborators::{
    CompletionOptions, CompletionService, ExtractionService, HistoryStore, QueryBackend,
};
pub use error::{CollaboratorError, EngineError, ErrorKind, Result, StepFailure};
pub use events::{
    progress_channel, EventError, EventKind, EventSink, ProgressEmitter, ProgressEvent,
    ProgressStream, VecEventSink,
};
pub use graph::{WorkflowGraph, WorkflowSteps};
pub use retry::{ExhaustionAction, RetryPolicy};
pub use state::{
    ConversationTurn, FailureDescriptor, Interpretation, Plan, QueryRows, RequestId,
    ResponsePayload, Role, Route, Stage, TerminalOutcome, Verdict, WorkflowState,
};
pub use step::{FnStep, Step, StepContext, StepResult};

// Re-exported so steps and hosts share one cancellation type
pub use tokio_util::sync::CancellationToken;
