//! Registry of live runs
//!
//! Maps request IDs to [`SessionHandle`]s for the lifetime of each run.
//! The registry holds weak references only; the executor's guard owns the
//! handle. Registration hands back a [`RegistrationGuard`]; dropping the guard is
//! the only way an entry leaves the registry, so removal happens exactly
//! once on every exit path of the executor, panics included.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pipeline_engine::RequestId;

use crate::error::{Result, SessionServiceError};
use crate::handle::{abandoned, SessionHandle};

type SessionKey = (String, String);

/// Concurrent map of live runs.
#[derive(Default)]
pub struct SessionRegistry {
    /// Live runs keyed by request ID
    runs: DashMap<RequestId, Weak<SessionHandle>>,
    /// Latest run of each (user, session)
    sessions: DashMap<SessionKey, RequestId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run.
    ///
    /// With `supersede` set, a live run of the same user and session is
    /// cancelled. The entry is removed when the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        supersede: bool,
    ) -> Result<RegistrationGuard> {
        let request_id = handle.request_id();
        match self.runs.entry(request_id) {
            Entry::Occupied(_) => return Err(SessionServiceError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(&handle));
            }
        }

        let key = (handle.user_id().to_string(), handle.session_id().to_string());
        let previous = self.sessions.insert(key, request_id);
        if let Some(previous) = previous.filter(|id| supersede && *id != request_id) {
            if let Some(older) = self.lookup(&previous) {
                log::info!("{}: superseded by {}", previous, request_id);
                older.cancel();
            }
        }

        log::debug!("{}: registered ({} live)", request_id, self.runs.len());
        Ok(RegistrationGuard {
            registry: Arc::clone(self),
            handle,
        })
    }

    /// Look up a live run.
    pub fn lookup(&self, request_id: &RequestId) -> Option<Arc<SessionHandle>> {
        self.runs.get(request_id).and_then(|entry| entry.value().upgrade())
    }

    /// Cancel a live run. Returns false if no such run is registered.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        match self.lookup(request_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// The live run of a user's session, if any.
    pub fn session_run(&self, user_id: &str, session_id: &str) -> Option<RequestId> {
        let key = (user_id.to_string(), session_id.to_string());
        self.sessions.get(&key).map(|entry| *entry.value())
    }

    /// Request IDs of all live runs.
    pub fn active_requests(&self) -> Vec<RequestId> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn remove(&self, handle: &SessionHandle) {
        let request_id = handle.request_id();
        if self.runs.remove(&request_id).is_none() {
            log::error!("{}: deregistered twice", request_id);
            return;
        }
        let key = (handle.user_id().to_string(), handle.session_id().to_string());
        self.sessions.remove_if(&key, |_, current| *current == request_id);
        log::debug!("{}: deregistered ({} live)", request_id, self.runs.len());
    }
}

/// Keeps a run registered until dropped.
pub struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
}

impl RegistrationGuard {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.handle.complete(abandoned(pipeline_engine::Stage::Failed)) {
            log::error!("{}: run ended without an outcome", self.handle.request_id());
        }
        self.registry.remove(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn handle(user: &str, session: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(RequestId::new(), user, session, CancellationToken::new()))
    }

    #[test]
    fn test_guard_removes_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let h = handle("u", "s");
        let guard = registry.register(h.clone(), true).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&h.request_id()).is_some());
        assert_eq!(registry.session_run("u", "s"), Some(h.request_id()));

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.lookup(&h.request_id()).is_none());
        assert_eq!(registry.session_run("u", "s"), None);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let h = handle("u", "s");
        let _guard = registry.register(h.clone(), false).unwrap();

        let err = registry.register(h, false).err().unwrap();
        assert!(matches!(err, SessionServiceError::DuplicateRequest(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_supersede_cancels_older_run() {
        let registry = Arc::new(SessionRegistry::new());
        let older = handle("u", "s");
        let other_session = handle("u", "t");
        let _g1 = registry.register(older.clone(), true).unwrap();
        let _g2 = registry.register(other_session.clone(), true).unwrap();

        let newer = handle("u", "s");
        let _g3 = registry.register(newer.clone(), true).unwrap();

        assert!(older.is_cancelled());
        assert!(!other_session.is_cancelled());
        assert!(!newer.is_cancelled());
        assert_eq!(registry.session_run("u", "s"), Some(newer.request_id()));
    }

    #[test]
    fn test_without_supersede_both_runs_stay_live() {
        let registry = Arc::new(SessionRegistry::new());
        let older = handle("u", "s");
        let g1 = registry.register(older.clone(), false).unwrap();
        let newer = handle("u", "s");
        let _g2 = registry.register(newer.clone(), false).unwrap();

        assert!(!older.is_cancelled());
        assert_eq!(registry.len(), 2);

        // The older run finishing must not clear the newer run's session entry.
        drop(g1);
        assert_eq!(registry.session_run("u", "s"), Some(newer.request_id()));
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let registry = SessionRegistry::new();
        assert!(!registry.cancel(&RequestId::new()));
    }

    #[test]
    fn test_dropped_guard_completes_pending_handle() {
        let registry = Arc::new(SessionRegistry::new());
        let h = handle("u", "s");
        drop(registry.register(h.clone(), true).unwrap());

        let outcome = h.outcome().unwrap();
        assert_eq!(
            outcome.error_kind(),
            Some(pipeline_engine::ErrorKind::InternalInvariantViolation)
        );
    }
}
