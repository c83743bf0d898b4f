//! Live detection of an unresponsive main context.
//!
//! A dedicated monitor thread repeatedly:
//!
//! 1. posts a trivial ticker to the main context if none is outstanding
//! 2. sleeps for the interval
//! 3. checks whether the ticker ran
//!
//! An outstanding ticker after a full interval is a candidate hang. It is
//! reported at most once per episode; the episode ends when the main context
//! finally runs the ticker. Candidates are suppressed while a debugger is
//! attached (unless configured otherwise) and while the OS itself says the
//! process is responding.
//!
//! The monitor never takes a lock across the sleep; shared state is two
//! atomics touched by the monitor and the ticker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vigil_protocol::Thread;

use crate::config::WatchdogSettings;

pub mod environment;
pub mod hang;
pub mod listener;
pub mod main_loop;

pub use environment::{
    DebuggerProbe, ForegroundState, LifecycleState, ProcessErrorState, TracerPidProbe,
    UnavailableProcessErrorState,
};
pub use hang::{HangError, HangSource, HANG_EXCEPTION_TYPE};
pub use listener::{HangListener, SinkHangListener};
pub use main_loop::{MainContext, MainLoop, MainLoopHandle, Task};

const MONITOR_THREAD_NAME: &str = "vigil-watchdog";

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub report_in_debug: bool,
}

impl From<&WatchdogSettings> for WatchdogConfig {
    fn from(settings: &WatchdogSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms.max(1)),
            report_in_debug: settings.report_in_debug,
        }
    }
}

/// What one monitor cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The ticker ran (or none was outstanding).
    Responsive,
    Reported,
    /// This episode was already reported.
    AlreadyReported,
    /// Debugger attached; the episode is marked reported.
    SuppressedDebugger,
    /// The OS does not consider the process unresponsive; rechecked next cycle.
    SuppressedByOs,
}

struct TickState {
    // Non-zero while a ticker is outstanding.
    tick: AtomicU64,
    reported: AtomicBool,
}

struct WatchdogInner {
    config: WatchdogConfig,
    main: Arc<dyn MainContext>,
    listener: Arc<dyn HangListener>,
    debugger: Arc<dyn DebuggerProbe>,
    process_state: Arc<dyn ProcessErrorState>,
    foreground: Arc<dyn ForegroundState>,
    state: Arc<TickState>,
    stopped: AtomicBool,
}

pub struct HangWatchdog {
    inner: Arc<WatchdogInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HangWatchdog {
    pub fn new(
        config: WatchdogConfig,
        main: Arc<dyn MainContext>,
        listener: Arc<dyn HangListener>,
    ) -> Self {
        Self::with_probes(
            config,
            main,
            listener,
            Arc::new(TracerPidProbe),
            Arc::new(UnavailableProcessErrorState),
            Arc::new(LifecycleState::default()),
        )
    }

    pub fn with_probes(
        config: WatchdogConfig,
        main: Arc<dyn MainContext>,
        listener: Arc<dyn HangListener>,
        debugger: Arc<dyn DebuggerProbe>,
        process_state: Arc<dyn ProcessErrorState>,
        foreground: Arc<dyn ForegroundState>,
    ) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                config,
                main,
                listener,
                debugger,
                process_state,
                foreground,
                state: Arc::new(TickState {
                    tick: AtomicU64::new(0),
                    reported: AtomicBool::new(false),
                }),
                stopped: AtomicBool::new(false),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Spawns the monitor thread. Calling it twice is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if monitor.is_some() {
            return Ok(());
        }

        self.inner.stopped.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(MONITOR_THREAD_NAME.to_string())
            .spawn(move || inner.run())?;
        *monitor = Some(handle);
        info!(interval_ms = self.inner.config.interval.as_millis() as u64, "Watchdog started");
        Ok(())
    }

    /// Stops and joins the monitor thread. The current sleep is interrupted.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Watchdog thread panicked");
            }
            info!("Watchdog stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// First half of a cycle: post a ticker unless one is outstanding.
    pub fn begin_cycle(&self) {
        self.inner.begin_cycle();
    }

    /// Second half of a cycle, run after the interval has elapsed.
    pub fn end_cycle(&self) -> CycleOutcome {
        self.inner.end_cycle()
    }
}

impl Drop for HangWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WatchdogInner {
    fn run(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            self.begin_cycle();
            if !self.sleep_interval() {
                debug!("Watchdog interrupted, exiting");
                return;
            }
            self.end_cycle();
        }
    }

    /// Returns false when woken by `stop`.
    fn sleep_interval(&self) -> bool {
        let deadline = Instant::now() + self.config.interval;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
    }

    fn begin_cycle(&self) {
        let state = &self.state;
        if state.tick.load(Ordering::SeqCst) != 0 {
            return;
        }

        let interval_ms = (self.config.interval.as_millis() as u64).max(1);
        state.tick.store(interval_ms, Ordering::SeqCst);

        let ticker_state = Arc::clone(state);
        let posted = self.main.post(Box::new(move || {
            ticker_state.tick.store(0, Ordering::SeqCst);
            ticker_state.reported.store(false, Ordering::SeqCst);
        }));
        if !posted {
            // Nothing left to monitor; don't blame a context that no longer exists.
            debug!("Main context rejected ticker");
            state.tick.store(0, Ordering::SeqCst);
        }
    }

    fn end_cycle(&self) -> CycleOutcome {
        let state = &self.state;
        if state.tick.load(Ordering::SeqCst) == 0 {
            return CycleOutcome::Responsive;
        }
        if state.reported.load(Ordering::SeqCst) {
            return CycleOutcome::AlreadyReported;
        }

        if !self.config.report_in_debug && self.debugger.is_debugger_attached() {
            debug!("Main context stalled while a debugger is attached, not reporting");
            state.reported.store(true, Ordering::SeqCst);
            return CycleOutcome::SuppressedDebugger;
        }

        if self.process_state.is_not_responding() == Some(false) {
            debug!("OS reports the process as responsive, not reporting");
            return CycleOutcome::SuppressedByOs;
        }

        let interval_ms = self.config.interval.as_millis() as u64;
        let background = self.foreground.is_background();
        let error = HangError::new(
            format!("Application Not Responding for at least {} ms.", interval_ms),
            HangSource::Watchdog,
            background,
            self.main_thread(),
        );
        info!(interval_ms, background, "Main context unresponsive");
        state.reported.store(true, Ordering::SeqCst);
        self.listener.on_hang(error);
        CycleOutcome::Reported
    }

    fn main_thread(&self) -> Thread {
        Thread {
            id: self.main.thread_id().unwrap_or_default(),
            name: Some("main".to_string()),
            main: true,
            stacktrace: self.main.stack_snapshot(),
            ..Thread::default()
        }
    }
}
