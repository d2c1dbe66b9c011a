//! Session affinity
//!
//! Remembers which worker last served a session so follow-up requests can be
//! routed back to it while the model and context are still warm.

use promptloop_proto::{SessionId, WorkerId};
use std::collections::HashMap;

/// Maps a session to the worker that last served it
#[derive(Debug, Default)]
pub struct AffinityTracker {
    entries: HashMap<SessionId, WorkerId>,
}

impl AffinityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to a worker, replacing any previous binding
    pub fn set(&mut self, session_id: &str, worker_id: &str) {
        self.entries
            .insert(session_id.to_string(), worker_id.to_string());
    }

    pub fn get(&self, session_id: &str) -> Option<&WorkerId> {
        self.entries.get(session_id)
    }

    /// Whether `session_id` is currently bound to `worker_id`
    pub fn is_bound_to(&self, session_id: &str, worker_id: &str) -> bool {
        self.get(session_id).map(|w| w == worker_id).unwrap_or(false)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<WorkerId> {
        self.entries.remove(session_id)
    }

    /// Drop every binding that points at `worker_id`
    ///
    /// Returns the number of sessions unbound.
    pub fn clear_worker(&mut self, worker_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, w| w != worker_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut tracker = AffinityTracker::new();
        assert!(tracker.get("s1").is_none());

        tracker.set("s1", "w1");
        assert_eq!(tracker.get("s1").map(String::as_str), Some("w1"));
        assert!(tracker.is_bound_to("s1", "w1"));
        assert!(!tracker.is_bound_to("s1", "w2"));

        tracker.set("s1", "w2");
        assert!(tracker.is_bound_to("s1", "w2"));
    }

    #[test]
    fn test_clear_worker() {
        let mut tracker = AffinityTracker::new();
        tracker.set("s1", "w1");
        tracker.set("s2", "w1");
        tracker.set("s3", "w2");

        assert_eq!(tracker.clear_worker("w1"), 2);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get("s1").is_none());
        assert!(tracker.is_bound_to("s3", "w2"));
    }
}
