//! Per-run session handle

use chrono::{DateTime, Utc};
use pipeline_engine::{ErrorKind, FailureDescriptor, RequestId, Stage, TerminalOutcome};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Control surface of one run: cancellation and completion.
///
/// The registry holds a handle for as long as the run is live; callers of
/// `start_run` keep their own reference to wait on the outcome.
pub struct SessionHandle {
    request_id: RequestId,
    user_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    cancellation: CancellationToken,
    completion: watch::Sender<Option<TerminalOutcome>>,
}

impl SessionHandle {
    pub fn new(
        request_id: RequestId,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            request_id,
            user_id: user_id.into(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            cancellation,
            completion,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Token observed by the run at every checkpoint.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The outcome, once the run has finished.
    pub fn outcome(&self) -> Option<TerminalOutcome> {
        self.completion.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.completion.borrow().is_some()
    }

    /// Record the outcome. Only the first call has an effect.
    pub(crate) fn complete(&self, outcome: TerminalOutcome) -> bool {
        let mut outcome = Some(outcome);
        self.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// Wait until the run has finished and return its outcome.
    pub async fn wait_for_completion(&self) -> TerminalOutcome {
        let mut rx = self.completion.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        // The sender lives in `self`, so the channel cannot close while we wait.
        outcome.unwrap_or_else(|| abandoned(Stage::Failed))
    }
}

/// Outcome recorded for a run that ended without reporting one.
pub(crate) fn abandoned(stage: Stage) -> TerminalOutcome {
    TerminalOutcome::Failure(FailureDescriptor {
        error_kind: ErrorKind::InternalInvariantViolation,
        detail: "The request ended unexpectedly".to_string(),
        stage,
    })
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("request_id", &self.request_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_engine::{ResponsePayload, Route};
    use std::sync::Arc;

    fn success() -> TerminalOutcome {
        TerminalOutcome::Success(ResponsePayload {
            answer: "42".into(),
            route: Route::DirectAnswer,
            query: None,
            row_count: None,
            validated: true,
        })
    }

    #[tokio::test]
    async fn test_wait_resolves_after_complete() {
        let handle = Arc::new(SessionHandle::new(
            RequestId::new(),
            "u",
            "s",
            CancellationToken::new(),
        ));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_completion().await })
        };

        assert!(handle.complete(success()));
        assert!(waiter.await.unwrap().is_success());
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_first_outcome_wins() {
        let handle = SessionHandle::new(RequestId::new(), "u", "s", CancellationToken::new());
        assert!(handle.complete(success()));
        assert!(!handle.complete(abandoned(Stage::Planning)));
        assert!(handle.wait_for_completion().await.is_success());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = SessionHandle::new(RequestId::new(), "u", "s", CancellationToken::new());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.outcome().is_none());
    }
}
