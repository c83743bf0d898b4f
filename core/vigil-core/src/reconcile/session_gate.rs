//! Wait for the previous session's own envelope before reconciling.
//!
//! At startup the host may still be persisting the session that ended with
//! the failure. Reconciling before that lands would report an exit whose
//! session data is missing, so the reconciler waits on this gate first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::sink::FlushLatch;

pub trait PreviousSessionGate: Send + Sync {
    /// Blocks until the previous session is flushed or `timeout` elapses.
    /// Returns whether it was flushed.
    fn wait_previous_session_flush(&self, timeout: Duration) -> bool;

    /// Forces the previous session out after a timed-out wait.
    fn flush_previous_session(&self);
}

/// Gate for hosts that have no previous-session persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreviousSession;

impl PreviousSessionGate for NoPreviousSession {
    fn wait_previous_session_flush(&self, _timeout: Duration) -> bool {
        true
    }

    fn flush_previous_session(&self) {}
}

type ForceFlush = Box<dyn FnOnce() + Send>;

/// Latch-backed gate. The host calls [`SessionFlushGate::mark_flushed`] once
/// the previous session is on disk.
pub struct SessionFlushGate {
    latch: Arc<FlushLatch>,
    force: Mutex<Option<ForceFlush>>,
}

impl SessionFlushGate {
    pub fn new(force: ForceFlush) -> Self {
        Self {
            latch: FlushLatch::new(),
            force: Mutex::new(Some(force)),
        }
    }

    pub fn mark_flushed(&self) {
        self.latch.signal();
    }
}

impl PreviousSessionGate for SessionFlushGate {
    fn wait_previous_session_flush(&self, timeout: Duration) -> bool {
        self.latch.wait(timeout)
    }

    fn flush_previous_session(&self) {
        let force = self
            .force
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match force {
            Some(force) => {
                force();
                self.latch.signal();
            }
            None => debug!("Previous session already force-flushed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn marked_gate_passes_immediately() {
        let gate = SessionFlushGate::new(Box::new(|| {}));
        gate.mark_flushed();
        assert!(gate.wait_previous_session_flush(Duration::from_millis(1)));
    }

    #[test]
    fn force_flush_runs_once_and_opens_gate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let gate = SessionFlushGate::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!gate.wait_previous_session_flush(Duration::from_millis(5)));
        gate.flush_previous_session();
        gate.flush_previous_session();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gate.wait_previous_session_flush(Duration::from_millis(1)));
    }
}
