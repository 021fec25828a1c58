//! Workflow state threaded through every step of a run.
//!
//! Steps receive the state by reference and return an updated copy. The
//! fields a step is allowed to change are public; the ones guarded by run
//! invariants (request id, retry counters, terminal outcome, current stage)
//! are only mutated by the engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};

/// Unique identifier of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// A named node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Routing,
    GeneratingQuery,
    ValidatingQuery,
    ExecutingQuery,
    Interpreting,
    ValidatingInterpretation,
    Responding,
    Done,
    Failed,
}

impl Stage {
    /// Whether this stage ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Get a human-readable label for this stage.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Planning => "Planning",
            Stage::Routing => "Routing",
            Stage::GeneratingQuery => "Generating query",
            Stage::ValidatingQuery => "Validating query",
            Stage::ExecutingQuery => "Executing query",
            Stage::Interpreting => "Interpreting results",
            Stage::ValidatingInterpretation => "Validating interpretation",
            Stage::Responding => "Responding",
            Stage::Done => "Done",
            Stage::Failed => "Failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One prior message of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Destination chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// The question needs data: synthesize and run a query.
    Query,
    /// The question can be answered without a query.
    DirectAnswer,
}

/// Structured plan produced once by the planning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// One-sentence restatement of what the user wants.
    pub summary: String,
    /// Where the router should send the run.
    pub route: Route,
    /// Entities, metrics or tables the question refers to.
    #[serde(default)]
    pub focus: Vec<String>,
}

/// A validator's accept/reject decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub accepted: bool,
    pub reason: String,
    /// Attempt this verdict applies to, starting at 1.
    #[serde(default)]
    pub attempt: u32,
}

impl Verdict {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: reason.into(),
            attempt: 0,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            attempt: 0,
        }
    }
}

/// Rows returned by the query backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Natural-language reading of a query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interpretation {
    pub text: String,
    /// False when the run proceeded without an accepting verdict.
    pub validated: bool,
}

impl Interpretation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            validated: false,
        }
    }
}

/// What a successful run hands back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub answer: String,
    pub route: Route,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    /// False when the interpretation was accepted best-effort.
    pub validated: bool,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDescriptor {
    pub error_kind: ErrorKind,
    pub detail: String,
    /// Stage the run was in when it failed.
    pub stage: Stage,
}

/// Final outcome of a run. Exactly one variant exists per finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Success(ResponsePayload),
    Failure(FailureDescriptor),
}

impl TerminalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalOutcome::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            TerminalOutcome::Success(_) => None,
            TerminalOutcome::Failure(failure) => Some(failure.error_kind),
        }
    }

    /// The terminal stage matching this outcome.
    pub fn stage(&self) -> Stage {
        match self {
            TerminalOutcome::Success(_) => Stage::Done,
            TerminalOutcome::Failure(_) => Stage::Failed,
        }
    }
}

/// The record threaded through every step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    request_id: RequestId,
    pub user_id: String,
    pub session_id: String,
    pub original_question: String,
    pub conversation_context: Vec<ConversationTurn>,
    pub plan: Option<Plan>,
    pub route: Option<Route>,
    pub candidate_query: Option<String>,
    pub query_validation: Option<Verdict>,
    pub execution_result: Option<QueryRows>,
    pub interpretation: Option<Interpretation>,
    pub interpretation_validation: Option<Verdict>,
    pub response: Option<ResponsePayload>,
    current_stage: Stage,
    retry_counters: BTreeMap<Stage, u32>,
    terminal_outcome: Option<TerminalOutcome>,
}

impl WorkflowState {
    /// Create the initial state of a run, positioned at `Planning`.
    pub fn new(
        request_id: RequestId,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            user_id: user_id.into(),
            session_id: session_id.into(),
            original_question: question.into(),
            conversation_context: Vec::new(),
            plan: None,
            route: None,
            candidate_query: None,
            query_validation: None,
            execution_result: None,
            interpretation: None,
            interpretation_validation: None,
            response: None,
            current_stage: Stage::Planning,
            retry_counters: BTreeMap::new(),
            terminal_outcome: None,
        }
    }

    /// Attach prior conversation turns.
    pub fn with_context(mut self, turns: Vec<ConversationTurn>) -> Self {
        self.conversation_context = turns;
        self
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    /// Number of rejected attempts recorded for a stage.
    pub fn retry_count(&self, stage: Stage) -> u32 {
        self.retry_counters.get(&stage).copied().unwrap_or(0)
    }

    pub fn retry_counters(&self) -> &BTreeMap<Stage, u32> {
        &self.retry_counters
    }

    pub fn terminal_outcome(&self) -> Option<&TerminalOutcome> {
        self.terminal_outcome.as_ref()
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        self.current_stage = stage;
    }

    /// Record one more rejected attempt and return the new count.
    pub(crate) fn record_retry(&mut self, stage: Stage) -> u32 {
        let counter = self.retry_counters.entry(stage).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Set the terminal outcome. Fails if one is already set.
    pub(crate) fn finish(&mut self, outcome: TerminalOutcome) -> Result<()> {
        if let Some(existing) = &self.terminal_outcome {
            return Err(EngineError::invariant(format!(
                "terminal outcome already set to {:?}",
                existing.stage()
            )));
        }
        self.current_stage = outcome.stage();
        self.terminal_outcome = Some(outcome);
        Ok(())
    }

    /// Overwrite a terminal outcome after an invariant violation was caught.
    ///
    /// Only the executor boundary uses this; everything else goes through
    /// [`WorkflowState::finish`].
    pub(crate) fn force_failure(&mut self, failure: FailureDescriptor) {
        self.current_stage = Stage::Failed;
        self.terminal_outcome = Some(TerminalOutcome::Failure(failure));
    }

    /// Check that `next`, returned by a step, is a legitimate successor of
    /// `self`: same run, counters not rewound, outcome untouched.
    pub(crate) fn check_successor(&self, next: &WorkflowState) -> Result<()> {
        if next.request_id != self.request_id {
            return Err(EngineError::invariant(format!(
                "step replaced request id {} with {}",
                self.request_id, next.request_id
            )));
        }
        for (stage, count) in &self.retry_counters {
            if next.retry_count(*stage) < *count {
                return Err(EngineError::invariant(format!(
                    "step rewound the retry counter of {}",
                    stage
                )));
            }
        }
        if next.terminal_outcome != self.terminal_outcome {
            return Err(EngineError::invariant("step changed the terminal outcome"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state() -> WorkflowState {
        WorkflowState::new(RequestId::new(), "user-1", "session-1", "What is the total count?")
    }

    #[test]
    fn test_new_state_starts_at_planning() {
        let state = make_state();
        assert_eq!(state.current_stage(), Stage::Planning);
        assert!(state.terminal_outcome().is_none());
        assert_eq!(state.retry_count(Stage::GeneratingQuery), 0);
    }

    #[test]
    fn test_retry_counters_only_increase() {
        let mut state = make_state();
        assert_eq!(state.record_retry(Stage::GeneratingQuery), 1);
        assert_eq!(state.record_retry(Stage::GeneratingQuery), 2);
        assert_eq!(state.retry_count(Stage::GeneratingQuery), 2);
        assert_eq!(state.retry_count(Stage::Interpreting), 0);
    }

    #[test]
    fn test_terminal_outcome_set_once() {
        let mut state = make_state();
        let failure = FailureDescriptor {
            error_kind: ErrorKind::Cancelled,
            detail: "cancelled".into(),
            stage: Stage::Planning,
        };
        state.finish(TerminalOutcome::Failure(failure.clone())).unwrap();
        assert_eq!(state.current_stage(), Stage::Failed);

        let err = state.finish(TerminalOutcome::Failure(failure)).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn test_successor_must_keep_request_id() {
        let state = make_state();
        let foreign = make_state();
        assert!(state.check_successor(&foreign).is_err());

        let mut updated = state.clone();
        updated.candidate_query = Some("SELECT 1".into());
        assert!(state.check_successor(&updated).is_ok());
    }

    #[test]
    fn test_successor_must_not_rewind_counters() {
        let mut state = make_state();
        let rewound = state.clone();
        state.record_retry(Stage::GeneratingQuery);
        assert!(state.check_successor(&rewound).is_err());
    }

    #[test]
    fn test_serialization() {
        let state = make_state();
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"currentStage\":\"planning\""));
        assert!(json.contains("\"originalQuestion\":\"What is the total count?\""));
    }
}
