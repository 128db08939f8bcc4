//! Session context - ambient key-value overlay for the current session
//!
//! Values such as `active_goal` or `current_task` live here for the length
//! of a processing session. They are never written to an adapter and are
//! cleared when the session ends. Context-aware queries read them to boost
//! matching items.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Snapshot of the session overlay
pub type ContextMap = BTreeMap<String, serde_json::Value>;

struct SessionState {
    session_id: String,
    started_at: DateTime<Utc>,
    values: ContextMap,
}

impl SessionState {
    fn fresh() -> Self {
        Self {
            session_id: generate_session_id(),
            started_at: Utc::now(),
            values: ContextMap::new(),
        }
    }
}

/// Session-scoped context overlay
pub struct SessionContext {
    state: RwLock<SessionState>,
}

impl SessionContext {
    /// Start a new session with a generated id
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::fresh()),
        }
    }

    /// Start a session with a caller-chosen id
    pub fn with_session_id(session_id: impl Into<String>) -> Self {
        let mut state = SessionState::fresh();
        state.session_id = session_id.into();
        Self {
            state: RwLock::new(state),
        }
    }

    /// Id of the current session
    pub fn session_id(&self) -> String {
        self.state.read().session_id.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.state.read().started_at
    }

    /// Set a value, replacing any previous one
    pub fn set(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        let key = key.into();
        tracing::debug!(context_key = %key, "context set");
        self.state.write().values.insert(key, value.into());
    }

    /// Value of one key
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state.read().values.get(key).cloned()
    }

    /// Remove a key, returning its value
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.state.write().values.remove(key)
    }

    /// Copy of every value
    pub fn snapshot(&self) -> ContextMap {
        self.state.read().values.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.read().values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the overlay and start a new session; returns the ended session id
    pub fn end_session(&self) -> String {
        let mut state = self.state.write();
        let ended = std::mem::replace(&mut *state, SessionState::fresh());
        tracing::debug!(
            session_id = %ended.session_id,
            entries = ended.values.len(),
            "session ended"
        );
        ended.session_id
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a session id
pub fn generate_session_id() -> String {
    format!("session-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_set_get_remove() {
        let context = SessionContext::new();
        context.set("active_goal", "ship release");
        context.set("current_task", serde_json::json!({"id": 7}));

        assert_eq!(context.get("active_goal").unwrap(), "ship release");
        assert_eq!(context.len(), 2);
        assert_eq!(context.remove("active_goal").unwrap(), "ship release");
        assert!(context.get("active_goal").is_none());
        assert_eq!(context.keys(), vec!["current_task".to_string()]);
    }

    #[test]
    fn test_end_session_clears_and_rotates_id() {
        let context = SessionContext::new();
        let first = context.session_id();
        assert!(first.starts_with("session-"));

        context.set("k", "v");
        let ended = context.end_session();
        assert_eq!(ended, first);
        assert!(context.is_empty());
        assert_ne!(context.session_id(), first);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let context = SessionContext::with_session_id("fixed");
        context.set("a", 1);
        let snapshot = context.snapshot();
        context.set("a", 2);
        assert_eq!(snapshot["a"], 1);
        assert_eq!(context.session_id(), "fixed");
    }
}
