//! Shutdown coordination.
//!
//! A TRY_SHUTDOWN request polls every event-subscribed client before the
//! daemon leaves the cluster; clients answer with SHUTDOWN_REPLY. The
//! controller tracks one poll at a time and exposes a watch channel the
//! main loop and the hello task select on to learn that the end has come.

use std::sync::Arc;

use arc_swap::ArcSwap;
use memberd_core::client::{SHUTDOWN_ANYWAY, SHUTDOWN_REMOVE};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::client::connection::ConnectionId;

/// Where the daemon is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation.
    Running,
    /// A shutdown poll is outstanding.
    Polling,
    /// Committed: LEAVE is being sent and the process will exit.
    Leaving,
}

/// An in-progress shutdown poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// The admin connection owed the final status reply.
    pub requester: ConnectionId,
    pub flags: u32,
    /// Replies still outstanding when the poll began.
    pub expected_replies: usize,
}

impl ShutdownRequest {
    /// Shutdown proceeds regardless of objections.
    #[must_use]
    pub fn forced(&self) -> bool {
        self.flags & SHUTDOWN_ANYWAY != 0
    }

    /// Leave as "removed", permitting the quorum to drop.
    #[must_use]
    pub fn remove(&self) -> bool {
        self.flags & SHUTDOWN_REMOVE != 0
    }
}

/// Coordinates the shutdown poll and the final leave.
#[derive(Debug)]
pub struct ShutdownController {
    phase: ArcSwap<ShutdownPhase>,
    request: Mutex<Option<ShutdownRequest>>,
    shutdown_signal: watch::Sender<bool>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            phase: ArcSwap::from_pointee(ShutdownPhase::Running),
            request: Mutex::new(None),
            shutdown_signal: tx,
        }
    }

    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        **self.phase.load()
    }

    /// A receiver that flips to true once shutdown is committed.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Starts a poll. Fails (returns false) if one is already running or
    /// shutdown is already committed.
    pub fn begin_poll(&self, requester: ConnectionId, flags: u32, expected_replies: usize) -> bool {
        if self.phase() != ShutdownPhase::Running {
            return false;
        }
        let mut request = self.request.lock();
        if request.is_some() {
            return false;
        }
        *request = Some(ShutdownRequest {
            requester,
            flags,
            expected_replies,
        });
        self.phase.store(Arc::new(ShutdownPhase::Polling));
        true
    }

    /// Current poll, if one is outstanding.
    #[must_use]
    pub fn current_poll(&self) -> Option<ShutdownRequest> {
        *self.request.lock()
    }

    /// Ends the poll. On approval the controller commits to Leaving and
    /// signals every watcher; on refusal it returns to Running. The
    /// original request is handed back so the requester can be answered.
    pub fn finish_poll(&self, approved: bool) -> Option<ShutdownRequest> {
        let taken = self.request.lock().take();
        if taken.is_none() {
            return None;
        }
        if approved {
            self.phase.store(Arc::new(ShutdownPhase::Leaving));
            let _ = self.shutdown_signal.send(true);
        } else {
            self.phase.store(Arc::new(ShutdownPhase::Running));
        }
        taken
    }

    /// Commits to shutdown without a poll (signal handler, KILLNODE, or
    /// transport eviction).
    pub fn force(&self) {
        self.request.lock().take();
        self.phase.store(Arc::new(ShutdownPhase::Leaving));
        let _ = self.shutdown_signal.send(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), ShutdownPhase::Running);
        assert!(!controller.is_shutting_down());
        assert!(controller.current_poll().is_none());
    }

    #[test]
    fn poll_lifecycle_approved() {
        let controller = ShutdownController::new();
        assert!(controller.begin_poll(ConnectionId(1), 0, 2));
        assert_eq!(controller.phase(), ShutdownPhase::Polling);

        // Only one poll at a time.
        assert!(!controller.begin_poll(ConnectionId(2), 0, 2));

        let request = controller.finish_poll(true).unwrap();
        assert_eq!(request.requester, ConnectionId(1));
        assert_eq!(controller.phase(), ShutdownPhase::Leaving);
    }

    #[test]
    fn poll_lifecycle_refused() {
        let controller = ShutdownController::new();
        assert!(controller.begin_poll(ConnectionId(1), 0, 1));
        let _ = controller.finish_poll(false).unwrap();
        assert_eq!(controller.phase(), ShutdownPhase::Running);

        // A new poll may start after refusal.
        assert!(controller.begin_poll(ConnectionId(2), 0, 1));
    }

    #[test]
    fn request_flags() {
        let request = ShutdownRequest {
            requester: ConnectionId(1),
            flags: SHUTDOWN_ANYWAY | SHUTDOWN_REMOVE,
            expected_replies: 0,
        };
        assert!(request.forced());
        assert!(request.remove());
    }

    #[tokio::test]
    async fn watchers_learn_of_commitment() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.begin_poll(ConnectionId(1), 0, 0);
        controller.finish_poll(true);

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn force_skips_polling() {
        let controller = ShutdownController::new();
        controller.force();
        assert_eq!(controller.phase(), ShutdownPhase::Leaving);
        assert!(!controller.begin_poll(ConnectionId(1), 0, 0));
    }
}
