//! Deadline-based failure detection for the hello task.
//!
//! A node is suspected dead once no HELLO has arrived within the configured
//! deadline. The detector only tracks timestamps; deciding what to do with
//! a suspect (the REMNODE transition) is the state machine's job.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Tracks per-node HELLO arrival times against a fixed deadline.
pub struct DeadlineDetector {
    deadline: Duration,
    last_seen: RwLock<HashMap<u32, Instant>>,
}

impl DeadlineDetector {
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    /// Records a heartbeat from `node_id`.
    pub fn heartbeat(&self, node_id: u32, at: Instant) {
        self.last_seen.write().insert(node_id, at);
    }

    /// Resets every tracked node's clock to `at`. Done after a transition
    /// completes, since HELLOs are suppressed during one and stale stamps
    /// would trigger a culling spree afterwards.
    pub fn reset_all(&self, at: Instant) {
        for stamp in self.last_seen.write().values_mut() {
            *stamp = at;
        }
    }

    /// True if the node has been quiet past the deadline.
    #[must_use]
    pub fn is_suspect(&self, node_id: u32, now: Instant) -> bool {
        match self.last_seen.read().get(&node_id) {
            Some(last) => now.duration_since(*last) > self.deadline,
            // Never heard from: give it a full deadline from first sight.
            None => false,
        }
    }

    /// All tracked nodes past the deadline.
    #[must_use]
    pub fn suspects(&self, now: Instant) -> Vec<u32> {
        self.last_seen
            .read()
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.deadline)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn remove(&self, node_id: u32) {
        self.last_seen.write().remove(&node_id);
    }

    pub fn reset(&self) {
        self.last_seen.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_not_suspect() {
        let detector = DeadlineDetector::new(Duration::from_secs(21));
        assert!(!detector.is_suspect(1, Instant::now()));
    }

    #[test]
    fn quiet_node_becomes_suspect() {
        let detector = DeadlineDetector::new(Duration::from_secs(21));
        let start = Instant::now();
        detector.heartbeat(1, start);

        assert!(!detector.is_suspect(1, start + Duration::from_secs(20)));
        assert!(detector.is_suspect(1, start + Duration::from_secs(22)));
    }

    #[test]
    fn heartbeat_clears_suspicion() {
        let detector = DeadlineDetector::new(Duration::from_secs(21));
        let start = Instant::now();
        detector.heartbeat(1, start);

        let late = start + Duration::from_secs(30);
        assert!(detector.is_suspect(1, late));

        detector.heartbeat(1, late);
        assert!(!detector.is_suspect(1, late + Duration::from_secs(1)));
    }

    #[test]
    fn suspects_lists_only_overdue_nodes() {
        let detector = DeadlineDetector::new(Duration::from_secs(21));
        let start = Instant::now();
        detector.heartbeat(1, start);
        detector.heartbeat(2, start + Duration::from_secs(15));

        let mut suspects = detector.suspects(start + Duration::from_secs(22));
        suspects.sort_unstable();
        assert_eq!(suspects, vec![1]);
    }

    #[test]
    fn reset_all_restarts_every_clock() {
        let detector = DeadlineDetector::new(Duration::from_secs(21));
        let start = Instant::now();
        detector.heartbeat(1, start);
        detector.heartbeat(2, start);

        let after = start + Duration::from_secs(30);
        detector.reset_all(after);
        assert!(detector.suspects(after + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn removed_nodes_are_forgotten() {
        let detector = DeadlineDetector::new(Duration::from_secs(21));
        let start = Instant::now();
        detector.heartbeat(1, start);
        detector.remove(1);
        assert!(detector.suspects(start + Duration::from_secs(60)).is_empty());
    }
}
