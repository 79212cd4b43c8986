use dashmap::DashMap;
use std::collections::VecDeque;

use crate::models::Turn;

/// Process-wide conversation history keyed by caller-supplied session id.
pub struct SessionStore {
    sessions: DashMap<String, VecDeque<Turn>>,
    max_stored_turns: usize,
}

impl SessionStore {
    pub fn new(max_stored_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_stored_turns: max_stored_turns.max(1),
        }
    }

    /// Append one turn; the oldest turns fall off past the stored cap.
    pub fn append(&self, session_id: &str, question: String, response: String) {
        let mut turns = self.sessions.entry(session_id.to_string()).or_default();
        turns.push_back(Turn::new(question, response));
        while turns.len() > self.max_stored_turns {
            turns.pop_front();
        }
    }

    /// The last `limit` turns, oldest first.
    pub fn recent(&self, session_id: &str, limit: usize) -> Vec<Turn> {
        self.sessions
            .get(session_id)
            .map(|turns| {
                let skip = turns.len().saturating_sub(limit);
                turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Always succeeds, including for unknown session ids.
    pub fn clear(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id);
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recent_returns_last_turns_in_chronological_order() {
        let store = SessionStore::new(100);
        for i in 0..5 {
            store.append("s1", format!("q{}", i), format!("r{}", i));
        }

        let questions: Vec<_> = store
            .recent("s1", 3)
            .into_iter()
            .map(|t| t.question)
            .collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
        assert_eq!(store.recent("s1", 10).len(), 5);
    }

    #[test]
    fn clearing_removes_every_turn() {
        let store = SessionStore::new(100);
        for i in 0..3 {
            store.append("s1", format!("q{}", i), format!("r{}", i));
        }

        assert!(store.clear("s1"));
        assert!(store.recent("s1", 10).is_empty());
    }

    #[test]
    fn clearing_unknown_session_is_not_an_error() {
        let store = SessionStore::new(100);
        assert!(store.clear("never-seen"));
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SessionStore::new(100);
        store.append("s1", "q".into(), "r".into());
        store.clear("s2");

        assert_eq!(store.recent("s1", 10).len(), 1);
        assert!(store.recent("s2", 10).is_empty());
    }

    #[test]
    fn write_side_cap_drops_oldest() {
        let store = SessionStore::new(2);
        store.append("s1", "q0".into(), "r0".into());
        store.append("s1", "q1".into(), "r1".into());
        store.append("s1", "q2".into(), "r2".into());

        let turns = store.recent("s1", 10);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question, "q1");
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_session_are_not_lost() {
        let store = Arc::new(SessionStore::new(1000));
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append("s1", format!("q{}", i), "r".into()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.recent("s1", 1000).len(), 20);
    }
}
