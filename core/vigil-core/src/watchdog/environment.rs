//! Process environment probes consulted before reporting a hang.

use std::sync::atomic::{AtomicBool, Ordering};

use fs_err as fs;
use tracing::debug;

pub trait DebuggerProbe: Send + Sync {
    fn is_debugger_attached(&self) -> bool;
}

/// Reads `TracerPid` from `/proc/self/status`. A non-zero tracer means a
/// debugger (or any ptrace user) is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracerPidProbe;

impl DebuggerProbe for TracerPidProbe {
    fn is_debugger_attached(&self) -> bool {
        match fs::read_to_string("/proc/self/status") {
            Ok(status) => tracer_pid(&status).map(|pid| pid != 0).unwrap_or(false),
            Err(err) => {
                debug!(error = %err, "Process status unavailable, assuming no debugger");
                false
            }
        }
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// The OS's own view of whether the process is currently not responding.
pub trait ProcessErrorState: Send + Sync {
    /// `None` when the platform offers no such query.
    fn is_not_responding(&self) -> Option<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProcessErrorState;

impl ProcessErrorState for UnavailableProcessErrorState {
    fn is_not_responding(&self) -> Option<bool> {
        None
    }
}

pub trait ForegroundState: Send + Sync {
    fn is_background(&self) -> bool;
}

/// Foreground flag updated by the host's lifecycle callbacks.
#[derive(Debug, Default)]
pub struct LifecycleState {
    background: AtomicBool,
}

impl LifecycleState {
    pub fn set_background(&self, background: bool) {
        self.background.store(background, Ordering::SeqCst);
    }
}

impl ForegroundState for LifecycleState {
    fn is_background(&self) -> bool {
        self.background.load(Ordering::SeqCst)
    }
}
