use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use lupa_core::current_unix_timestamp_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One conversational turn kept in the working window.
pub struct SessionTurn {
    pub role: String,
    pub text: String,
    pub timestamp_unix_ms: u64,
}

/// Per-session working context: in-memory, bounded turn window, evicted when
/// the session closes.
pub struct WorkingContextStore {
    sessions: Mutex<BTreeMap<String, VecDeque<SessionTurn>>>,
    max_turns: usize,
}

impl WorkingContextStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            max_turns: max_turns.max(1),
        }
    }

    pub fn append_turn(&self, session_id: &str, role: &str, text: &str) {
        let mut sessions = lock_or_recover(&self.sessions);
        let window = sessions.entry(session_id.to_string()).or_default();
        window.push_back(SessionTurn {
            role: role.to_string(),
            text: text.to_string(),
            timestamp_unix_ms: current_unix_timestamp_ms(),
        });
        while window.len() > self.max_turns {
            window.pop_front();
        }
    }

    pub fn recent_turns(&self, session_id: &str) -> Vec<SessionTurn> {
        lock_or_recover(&self.sessions)
            .get(session_id)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn close_session(&self, session_id: &str) {
        lock_or_recover(&self.sessions).remove(session_id);
    }

    pub fn open_sessions(&self) -> usize {
        lock_or_recover(&self.sessions).len()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::WorkingContextStore;

    #[test]
    fn functional_window_is_bounded_and_drops_oldest() {
        let store = WorkingContextStore::new(3);
        for index in 0..5 {
            store.append_turn("sess-1", "user", &format!("turno {index}"));
        }
        let turns = store.recent_turns("sess-1");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "turno 2");
        assert_eq!(turns[2].text, "turno 4");
    }

    #[test]
    fn functional_session_close_evicts_context() {
        let store = WorkingContextStore::new(10);
        store.append_turn("sess-1", "user", "olá");
        assert_eq!(store.open_sessions(), 1);
        store.close_session("sess-1");
        assert_eq!(store.open_sessions(), 0);
        assert!(store.recent_turns("sess-1").is_empty());
    }

    #[test]
    fn unit_sessions_are_isolated() {
        let store = WorkingContextStore::new(10);
        store.append_turn("sess-a", "user", "consulta A");
        store.append_turn("sess-b", "user", "consulta B");
        assert_eq!(store.recent_turns("sess-a").len(), 1);
        assert_eq!(store.recent_turns("sess-b").len(), 1);
    }
}
