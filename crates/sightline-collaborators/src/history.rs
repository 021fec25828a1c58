//! In-memory conversation history

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use pipeline_engine::{CollaboratorError, ConversationTurn, HistoryStore};

/// Default number of turns kept per session
pub const DEFAULT_MAX_TURNS: usize = 100;

type SessionKey = (String, String);

/// History store keeping the most recent turns of every session in memory.
///
/// Nothing survives a restart.
pub struct InMemoryHistoryStore {
    sessions: RwLock<HashMap<SessionKey, Vec<ConversationTurn>>>,
    max_turns: usize,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::with_max_turns(DEFAULT_MAX_TURNS)
    }

    /// Keep at most `max_turns` turns per session, dropping the oldest.
    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns: max_turns.max(1),
        }
    }

    /// Number of sessions with at least one turn
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        user_id: &str,
        session_id: &str,
        turn: ConversationTurn,
    ) -> Result<(), CollaboratorError> {
        let mut sessions = self.sessions.write();
        let turns = sessions
            .entry((user_id.to_string(), session_id.to_string()))
            .or_default();
        turns.push(turn);
        if turns.len() > self.max_turns {
            let excess = turns.len() - self.max_turns;
            turns.drain(..excess);
        }
        Ok(())
    }

    async fn read(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, CollaboratorError> {
        let sessions = self.sessions.read();
        let key = (user_id.to_string(), session_id.to_string());
        let turns = match sessions.get(&key) {
            Some(turns) => turns,
            None => return Ok(Vec::new()),
        };
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_returns_most_recent_oldest_first() {
        let store = InMemoryHistoryStore::new();
        for i in 0..5 {
            store.append("u", "s", ConversationTurn::user(format!("q{}", i))).await.unwrap();
        }

        let turns = store.read("u", "s", 2).await.unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["q3", "q4"]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = InMemoryHistoryStore::new();
        store.append("u", "a", ConversationTurn::user("hello")).await.unwrap();

        assert!(store.read("u", "b", 10).await.unwrap().is_empty());
        assert!(store.read("other", "a", 10).await.unwrap().is_empty());
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_oldest_turns_are_dropped() {
        let store = InMemoryHistoryStore::with_max_turns(3);
        for i in 0..5 {
            store.append("u", "s", ConversationTurn::assistant(format!("a{}", i))).await.unwrap();
        }

        let turns = store.read("u", "s", 10).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "a2");
    }
}
