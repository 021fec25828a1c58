//! The public run API: `start_run`, `cancel_run` and `serve`.

use std::sync::Arc;

use pipeline_engine::{
    progress_channel, EventError, EventSink, HistoryStore, ProgressStream, RequestId,
    TerminalOutcome, WorkflowGraph, WorkflowSteps,
};
use tokio_util::sync::CancellationToken;

use crate::config::SessionServiceConfig;
use crate::error::{Result, SessionServiceError};
use crate::executor::{ExecutorDeps, RunRequest, SessionExecutor};
use crate::handle::SessionHandle;
use crate::registry::SessionRegistry;

/// A started run: its ID, its event stream, and its handle.
pub struct RunHandle {
    pub request_id: RequestId,
    pub events: ProgressStream,
    handle: Arc<SessionHandle>,
}

impl RunHandle {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Split into the event stream and the handle.
    pub fn into_parts(self) -> (ProgressStream, Arc<SessionHandle>) {
        (self.events, self.handle)
    }
}

/// Entry point for answering questions.
///
/// Every run executes on its own tokio task; the registry is the only state
/// shared between runs.
#[derive(Clone)]
pub struct SessionService {
    deps: Arc<ExecutorDeps>,
    registry: Arc<SessionRegistry>,
}

impl SessionService {
    pub fn new(
        steps: WorkflowSteps,
        history: Arc<dyn HistoryStore>,
        config: SessionServiceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let graph = WorkflowGraph::new(steps)
            .with_query_policy(config.query_policy)
            .with_interpretation_policy(config.interpretation_policy);
        Ok(Self {
            deps: Arc::new(ExecutorDeps {
                graph,
                history,
                config,
            }),
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    pub fn config(&self) -> &SessionServiceConfig {
        &self.deps.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of live runs.
    pub fn active_runs(&self) -> usize {
        self.registry.len()
    }

    /// Start answering `question` and return the run's event stream.
    ///
    /// Cancelling `cancellation` cancels the run. The run is registered
    /// before this returns, so [`SessionService::cancel_run`] works at once.
    pub fn start_run(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        question: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Result<RunHandle> {
        let request = RunRequest {
            user_id: user_id.into(),
            session_id: session_id.into(),
            question: question.into(),
        };
        if request.question.trim().is_empty() {
            return Err(SessionServiceError::InvalidRequest("question is empty".to_string()));
        }

        let request_id = RequestId::new();
        // A child token: the caller's cancellation reaches the run, while
        // cancel_run never touches the caller's token.
        let handle = Arc::new(SessionHandle::new(
            request_id,
            request.user_id.clone(),
            request.session_id.clone(),
            cancellation.child_token(),
        ));
        let guard = self
            .registry
            .register(Arc::clone(&handle), self.deps.config.supersede_in_flight)?;

        let (emitter, events) = progress_channel(request_id, self.deps.config.event_buffer);
        let executor = SessionExecutor::new(Arc::clone(&self.deps), request, emitter, guard);
        tokio::spawn(executor.run());

        Ok(RunHandle {
            request_id,
            events,
            handle,
        })
    }

    /// Cancel a run. Unknown and finished runs are a no-op.
    ///
    /// Returns whether a live run was signalled.
    pub fn cancel_run(&self, request_id: &RequestId) -> bool {
        let cancelled = self.registry.cancel(request_id);
        if cancelled {
            log::info!("{}: cancellation requested", request_id);
        } else {
            log::debug!("{}: cancel ignored, run not live", request_id);
        }
        cancelled
    }

    /// Run a question while forwarding its events into `sink`.
    ///
    /// A sink that reports [`EventError::Disconnected`] cancels the run; the
    /// remaining events are drained so the run can finish and deregister.
    pub async fn serve(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        question: impl Into<String>,
        cancellation: CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<TerminalOutcome> {
        let run = self.start_run(user_id, session_id, question, cancellation)?;
        let request_id = run.request_id;
        let (mut events, handle) = run.into_parts();

        let mut connected = true;
        while let Some(event) = events.next_event().await {
            if !connected {
                continue;
            }
            if let Err(EventError::Disconnected) = sink.send(event).await {
                log::info!("{}: client disconnected", request_id);
                connected = false;
                self.cancel_run(&request_id);
            }
        }

        Ok(handle.wait_for_completion().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pipeline_engine::{
        CollaboratorError, ConversationTurn, ErrorKind, EventKind, FnStep, Interpretation, Plan,
        ProgressEvent, QueryRows, ResponsePayload, Route, Stage, Step, StepContext, StepResult,
        Verdict, VecEventSink, WorkflowState,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    /// History store backed by a map, optionally failing every call.
    #[derive(Default)]
    struct TestHistory {
        turns: Mutex<HashMap<(String, String), Vec<ConversationTurn>>>,
        fail: bool,
    }

    #[async_trait]
    impl HistoryStore for TestHistory {
        async fn append(
            &self,
            user_id: &str,
            session_id: &str,
            turn: ConversationTurn,
        ) -> std::result::Result<(), CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError::StoreUnavailable("down".into()));
            }
            self.turns
                .lock()
                .entry((user_id.to_string(), session_id.to_string()))
                .or_default()
                .push(turn);
            Ok(())
        }

        async fn read(
            &self,
            user_id: &str,
            session_id: &str,
            _limit: usize,
        ) -> std::result::Result<Vec<ConversationTurn>, CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError::StoreUnavailable("down".into()));
            }
            let key = (user_id.to_string(), session_id.to_string());
            Ok(self.turns.lock().get(&key).cloned().unwrap_or_default())
        }
    }

    /// Planner that waits for cancellation when the question is "slow".
    struct GatedPlanner;

    #[async_trait]
    impl Step for GatedPlanner {
        fn name(&self) -> &str {
            "gated-planner"
        }

        async fn run(&self, state: &WorkflowState, ctx: &StepContext) -> StepResult {
            if state.original_question == "slow" {
                ctx.cancellation.cancelled().await;
            }
            let mut next = state.clone();
            next.plan = Some(Plan {
                summary: state.original_question.clone(),
                route: Route::Query,
                focus: vec![],
            });
            StepResult::proceed(next)
        }
    }

    fn step<F>(name: &str, f: F) -> Arc<dyn Step>
    where
        F: Fn(&WorkflowState, &StepContext) -> StepResult + Send + Sync + 'static,
    {
        Arc::new(FnStep::new(name, f))
    }

    fn steps(planner: Arc<dyn Step>) -> WorkflowSteps {
        WorkflowSteps {
            planner,
            router: step("router", |s, _| {
                let mut next = s.clone();
                next.route = s.plan.as_ref().map(|p| p.route);
                StepResult::proceed(next)
            }),
            query_generator: step("generator", |s, _| {
                let mut next = s.clone();
                next.candidate_query = Some("SELECT count(*) FROM t".into());
                StepResult::proceed(next)
            }),
            query_validator: step("query-validator", |s, _| {
                let mut next = s.clone();
                next.query_validation = Some(Verdict::accept("ok"));
                StepResult::proceed(next)
            }),
            query_executor: step("executor", |s, _| {
                let mut next = s.clone();
                let rows = (0..5).map(|i| vec![json!(i)]).collect();
                next.execution_result = Some(QueryRows::new(vec!["n".into()], rows));
                StepResult::proceed(next)
            }),
            interpreter: step("interpreter", |s, _| {
                let mut next = s.clone();
                next.interpretation = Some(Interpretation::new(format!(
                    "Answer to {}",
                    s.original_question
                )));
                StepResult::proceed(next)
            }),
            interpretation_validator: step("interpretation-validator", |s, _| {
                let mut next = s.clone();
                next.interpretation_validation = Some(Verdict::accept("ok"));
                StepResult::proceed(next)
            }),
            responder: step("responder", |s, _| {
                let mut next = s.clone();
                let interpretation = s
                    .interpretation
                    .clone()
                    .unwrap_or_else(|| Interpretation::new("none"));
                next.response = Some(ResponsePayload {
                    answer: interpretation.text,
                    route: Route::Query,
                    query: s.candidate_query.clone(),
                    row_count: s.execution_result.as_ref().map(|r| r.row_count()),
                    validated: interpretation.validated,
                });
                StepResult::proceed(next)
            }),
        }
    }

    fn service_with(history: Arc<TestHistory>, config: SessionServiceConfig) -> SessionService {
        SessionService::new(steps(Arc::new(GatedPlanner)), history, config).unwrap()
    }

    fn service() -> (SessionService, Arc<TestHistory>) {
        let history = Arc::new(TestHistory::default());
        (service_with(history.clone(), SessionServiceConfig::default()), history)
    }

    async fn next_of_kind(
        events: &mut ProgressStream,
        stage: Stage,
        kind: EventKind,
    ) -> ProgressEvent {
        loop {
            let event = events.next_event().await.expect("stream ended early");
            if event.stage() == stage && event.kind() == kind {
                return event;
            }
        }
    }

    fn final_kind(events: &[ProgressEvent]) -> Option<ErrorKind> {
        let last = events.last().expect("no events");
        assert!(last.is_final());
        last.outcome().and_then(|o| o.error_kind())
    }

    #[tokio::test]
    async fn test_run_completes_and_deregisters() {
        let (service, history) = service();
        let run = service
            .start_run("u", "s", "What is the total count?", CancellationToken::new())
            .unwrap();
        assert_eq!(service.active_runs(), 1);

        let events = run.events.collect_all().await;
        assert_eq!(final_kind(&events), None);
        assert!(events.iter().all(|e| e.request_id() == run.request_id));
        assert_eq!(service.active_runs(), 0);
        assert!(run.handle.outcome().unwrap().is_success());

        let recorded = history.read("u", "s", 10).await.unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].text, "What is the total count?");
        assert_eq!(recorded[1].text, "Answer to What is the total count?");
    }

    #[tokio::test]
    async fn test_cancel_run_mid_flight() {
        let (service, _) = service();
        let mut run = service.start_run("u", "s", "slow", CancellationToken::new()).unwrap();

        next_of_kind(&mut run.events, Stage::Planning, EventKind::Started).await;
        assert!(service.cancel_run(&run.request_id));

        let rest = run.events.collect_all().await;
        assert_eq!(final_kind(&rest), Some(ErrorKind::Cancelled));
        assert!(!rest.iter().any(|e| e.stage() == Stage::Routing));
        assert_eq!(service.active_runs(), 0);

        // Idempotent once finished.
        assert!(!service.cancel_run(&run.request_id));
        assert!(!service.cancel_run(&RequestId::new()));
    }

    #[tokio::test]
    async fn test_caller_token_cancels_before_first_step() {
        let (service, _) = service();
        let token = CancellationToken::new();
        token.cancel();
        let run = service.start_run("u", "s", "What is the total count?", token).unwrap();

        let events = run.events.collect_all().await;
        assert_eq!(final_kind(&events), Some(ErrorKind::Cancelled));
        assert!(events.len() <= 2);
        if events.len() == 2 {
            assert_eq!(
                (events[0].stage(), events[0].kind()),
                (Stage::Planning, EventKind::Started)
            );
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let (service, _) = service();
        let mut slow = service.start_run("alice", "s1", "slow", CancellationToken::new()).unwrap();
        let fast = service.start_run("bob", "s2", "fast", CancellationToken::new()).unwrap();

        next_of_kind(&mut slow.events, Stage::Planning, EventKind::Started).await;
        let fast_events = fast.events.collect_all().await;
        assert_eq!(final_kind(&fast_events), None);
        assert!(fast_events.iter().all(|e| e.request_id() == fast.request_id));
        assert!(!slow.handle.is_cancelled());

        service.cancel_run(&slow.request_id);
        let slow_events = slow.events.collect_all().await;
        assert_eq!(final_kind(&slow_events), Some(ErrorKind::Cancelled));
        assert!(slow_events.iter().all(|e| e.request_id() == slow.request_id));
        assert_eq!(service.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_new_run_supersedes_in_flight_run() {
        let (service, _) = service();
        let mut older = service.start_run("u", "s", "slow", CancellationToken::new()).unwrap();
        next_of_kind(&mut older.events, Stage::Planning, EventKind::Started).await;

        let newer = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();
        assert!(older.handle.is_cancelled());

        let older_events = older.events.collect_all().await;
        assert_eq!(final_kind(&older_events), Some(ErrorKind::Cancelled));
        let newer_events = newer.events.collect_all().await;
        assert_eq!(final_kind(&newer_events), None);
    }

    #[tokio::test]
    async fn test_supersede_disabled_keeps_older_run() {
        let config = SessionServiceConfig {
            supersede_in_flight: false,
            ..Default::default()
        };
        let service = service_with(Arc::new(TestHistory::default()), config);
        let older = service.start_run("u", "s", "slow", CancellationToken::new()).unwrap();
        let newer = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();

        newer.events.collect_all().await;
        assert!(!older.handle.is_cancelled());
        older.cancel();
        assert_eq!(final_kind(&older.events.collect_all().await), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_step_fails_only_its_run() {
        let history = Arc::new(TestHistory::default());
        let mut steps = steps(Arc::new(GatedPlanner));
        steps.query_generator = step("generator", |s: &WorkflowState, _: &StepContext| {
            if s.original_question == "explode" {
                panic!("generator exploded");
            }
            let mut next = s.clone();
            next.candidate_query = Some("SELECT 1".into());
            StepResult::proceed(next)
        });
        let service = SessionService::new(steps, history, SessionServiceConfig::default()).unwrap();

        let run = service.start_run("u", "s", "explode", CancellationToken::new()).unwrap();
        let events = run.events.collect_all().await;
        assert_eq!(final_kind(&events), Some(ErrorKind::InternalInvariantViolation));
        match events.last().and_then(|e| e.outcome()) {
            Some(TerminalOutcome::Failure(f)) => {
                assert_eq!(f.stage, Stage::GeneratingQuery);
                assert!(!f.detail.contains("exploded"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(service.active_runs(), 0);

        let run = service.start_run("u", "s", "fine", CancellationToken::new()).unwrap();
        assert_eq!(final_kind(&run.events.collect_all().await), None);
    }

    #[tokio::test]
    async fn test_history_failure_does_not_change_outcome() {
        let history = Arc::new(TestHistory {
            fail: true,
            ..Default::default()
        });
        let service = service_with(history, SessionServiceConfig::default());
        let run = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();
        assert_eq!(final_kind(&run.events.collect_all().await), None);
    }

    /// History store that panics on read or on append.
    struct PanickingHistory {
        on_read: bool,
    }

    #[async_trait]
    impl HistoryStore for PanickingHistory {
        async fn append(
            &self,
            _user_id: &str,
            _session_id: &str,
            _turn: ConversationTurn,
        ) -> std::result::Result<(), CollaboratorError> {
            panic!("history append exploded");
        }

        async fn read(
            &self,
            _user_id: &str,
            _session_id: &str,
            _limit: usize,
        ) -> std::result::Result<Vec<ConversationTurn>, CollaboratorError> {
            if self.on_read {
                panic!("history read exploded");
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_panicking_history_read_still_ends_with_final_event() {
        let history = Arc::new(PanickingHistory { on_read: true });
        let config = SessionServiceConfig::default();
        let service = SessionService::new(steps(Arc::new(GatedPlanner)), history, config).unwrap();

        let run = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();
        let events = run.events.collect_all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(final_kind(&events), Some(ErrorKind::InternalInvariantViolation));
        match events[0].outcome() {
            Some(TerminalOutcome::Failure(f)) => assert_eq!(f.stage, Stage::Planning),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(service.active_runs(), 0);
        assert!(run.handle.outcome().is_some());
    }

    #[tokio::test]
    async fn test_panicking_history_append_still_ends_with_final_event() {
        let history = Arc::new(PanickingHistory { on_read: false });
        let config = SessionServiceConfig::default();
        let service = SessionService::new(steps(Arc::new(GatedPlanner)), history, config).unwrap();

        let run = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();
        let events = run.events.collect_all().await;
        assert_eq!(final_kind(&events), Some(ErrorKind::InternalInvariantViolation));
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number(), i as u64);
        }
        assert_eq!(service.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_history_is_passed_as_context() {
        let (service, history) = service();
        history.append("u", "s", ConversationTurn::user("earlier")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut steps = steps(Arc::new(GatedPlanner));
        let seen_by_step = seen.clone();
        steps.router = step("router", move |s: &WorkflowState, _: &StepContext| {
            seen_by_step.lock().extend(s.conversation_context.iter().map(|t| t.text.clone()));
            let mut next = s.clone();
            next.route = s.plan.as_ref().map(|p| p.route);
            StepResult::proceed(next)
        });
        let service = SessionService::new(steps, history, service.config().clone()).unwrap();

        let run = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();
        run.events.collect_all().await;
        assert_eq!(*seen.lock(), vec!["earlier".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let (service, _) = service();
        let err = service.start_run("u", "s", "   ", CancellationToken::new()).err().unwrap();
        assert!(matches!(err, SessionServiceError::InvalidRequest(_)));
        assert_eq!(service.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let (service, _) = service();
        let run = service.start_run("u", "s", "fast", CancellationToken::new()).unwrap();
        let (events, handle) = run.into_parts();
        let drain = tokio::spawn(events.collect_all());

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait_for_completion())
            .await
            .unwrap();
        assert!(outcome.is_success());
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_forwards_every_event() {
        let (service, _) = service();
        let sink = Arc::new(VecEventSink::new());
        let outcome = service
            .serve("u", "s", "fast", CancellationToken::new(), sink.clone())
            .await
            .unwrap();

        assert!(outcome.is_success());
        let events = sink.events();
        assert!(events.last().unwrap().is_final());
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number(), i as u64);
        }
    }

    /// Accepts `limit` events, then reports the client gone.
    struct DisconnectingSink {
        limit: usize,
        received: Mutex<Vec<ProgressEvent>>,
    }

    #[async_trait]
    impl EventSink for DisconnectingSink {
        async fn send(&self, event: ProgressEvent) -> std::result::Result<(), EventError> {
            let mut received = self.received.lock();
            if received.len() >= self.limit {
                return Err(EventError::Disconnected);
            }
            received.push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_run() {
        let (service, _) = service();
        let sink = Arc::new(DisconnectingSink {
            limit: 0,
            received: Mutex::new(Vec::new()),
        });
        let outcome = service
            .serve("u", "s", "slow", CancellationToken::new(), sink.clone())
            .await
            .unwrap();

        assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
        assert!(sink.received.lock().is_empty());
        assert_eq!(service.active_runs(), 0);
    }
}
