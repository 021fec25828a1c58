//! Session executor
//!
//! Drives exactly one run: reads conversation history, walks the workflow
//! graph, records the exchange, and emits the final event. Panics inside
//! steps or the history store are caught here and reported as a failed run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use pipeline_engine::{
    ConversationTurn, ErrorKind, FailureDescriptor, HistoryStore, ProgressEmitter, Stage,
    TerminalOutcome, WorkflowGraph, WorkflowState,
};

use crate::config::SessionServiceConfig;
use crate::handle::SessionHandle;
use crate::registry::RegistrationGuard;

/// Dependencies shared by every executor of a service.
pub(crate) struct ExecutorDeps {
    pub graph: WorkflowGraph,
    pub history: Arc<dyn HistoryStore>,
    pub config: SessionServiceConfig,
}

/// One run's question and identity.
pub(crate) struct RunRequest {
    pub user_id: String,
    pub session_id: String,
    pub question: String,
}

/// Owns one run from registration to the final event.
pub(crate) struct SessionExecutor {
    deps: Arc<ExecutorDeps>,
    request: RunRequest,
    emitter: ProgressEmitter,
    guard: RegistrationGuard,
}

impl SessionExecutor {
    pub(crate) fn new(
        deps: Arc<ExecutorDeps>,
        request: RunRequest,
        emitter: ProgressEmitter,
        guard: RegistrationGuard,
    ) -> Self {
        Self {
            deps,
            request,
            emitter,
            guard,
        }
    }

    fn handle(&self) -> &Arc<SessionHandle> {
        self.guard.handle()
    }

    /// Run to completion and return the outcome carried by the final event.
    pub(crate) async fn run(mut self) -> TerminalOutcome {
        let handle = Arc::clone(self.handle());
        let request_id = handle.request_id();
        log::info!(
            "{}: run started for user {} session {}",
            request_id,
            self.request.user_id,
            self.request.session_id
        );

        // Collaborators and steps run inside the unwind boundary so the
        // final event below is sent on every path.
        let outcome = match AssertUnwindSafe(self.answer()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let stage = self.emitter.last_stage().unwrap_or(Stage::Planning);
                log::error!(
                    "{}: panic in {}: {}",
                    request_id,
                    stage,
                    panic_message(panic.as_ref())
                );
                generic_failure(stage)
            }
        };

        handle.complete(outcome.clone());
        let Self { emitter, guard, .. } = self;
        // Deregister before the final event so a consumer that has seen the
        // end of the stream never finds the run still live.
        drop(guard);
        if emitter.finish(outcome.clone()).await.is_err() {
            log::debug!("{}: final event had no consumer", request_id);
        }
        log::info!(
            "{}: run finished in {} ms ({})",
            request_id,
            (Utc::now() - handle.started_at()).num_milliseconds(),
            outcome.error_kind().map(|k| k.as_str()).unwrap_or("success")
        );
        outcome
    }

    /// Read history, walk the graph and record the exchange.
    async fn answer(&mut self) -> TerminalOutcome {
        let context = self.read_history().await;
        let state = WorkflowState::new(
            self.handle().request_id(),
            self.request.user_id.clone(),
            self.request.session_id.clone(),
            self.request.question.clone(),
        )
        .with_context(context);

        let deps = Arc::clone(&self.deps);
        let cancellation = self.handle().cancellation().clone();
        let state = deps.graph.drive(state, &mut self.emitter, &cancellation).await;

        let outcome = match state.terminal_outcome() {
            Some(outcome) => outcome.clone(),
            None => {
                log::error!("{}: graph returned without an outcome", state.request_id());
                generic_failure(state.current_stage())
            }
        };
        if outcome.is_success() && deps.config.record_history {
            self.record_history(&state).await;
        }
        outcome
    }

    async fn read_history(&self) -> Vec<ConversationTurn> {
        let limit = self.deps.config.history_limit;
        if limit == 0 {
            return Vec::new();
        }
        let read = self
            .deps
            .history
            .read(&self.request.user_id, &self.request.session_id, limit);
        tokio::select! {
            _ = self.handle().cancellation().cancelled() => Vec::new(),
            result = read => match result {
                Ok(turns) => turns,
                Err(e) => {
                    log::warn!(
                        "{}: history unavailable, continuing without context: {}",
                        self.handle().request_id(),
                        e
                    );
                    Vec::new()
                }
            },
        }
    }

    async fn record_history(&self, state: &WorkflowState) {
        let Some(answer) = state.response.as_ref().map(|r| r.answer.clone()) else {
            return;
        };
        let turns = [
            ConversationTurn::user(state.original_question.clone()),
            ConversationTurn::assistant(answer),
        ];
        for turn in turns {
            if let Err(e) = self
                .deps
                .history
                .append(&state.user_id, &state.session_id, turn)
                .await
            {
                log::warn!("{}: failed to record history: {}", state.request_id(), e);
                return;
            }
        }
    }
}

fn generic_failure(stage: Stage) -> TerminalOutcome {
    TerminalOutcome::Failure(FailureDescriptor {
        error_kind: ErrorKind::InternalInvariantViolation,
        detail: "The request failed unexpectedly".to_string(),
        stage,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
