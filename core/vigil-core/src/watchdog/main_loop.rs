//! The main execution context as seen by the watchdog.
//!
//! Hosts with their own UI loop implement [`MainContext`] over it. Rust hosts
//! without one can use [`MainLoop`], a channel-backed single-threaded task
//! queue.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil_protocol::{StackFrame, Stacktrace};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait MainContext: Send + Sync {
    /// Schedules `task` on the main context. Must not block. Returns false
    /// when the context is gone.
    fn post(&self, task: Task) -> bool;

    /// Best-effort view of what the main context is executing right now.
    fn stack_snapshot(&self) -> Option<Stacktrace> {
        None
    }

    fn thread_id(&self) -> Option<u64> {
        None
    }
}

struct Job {
    label: &'static str,
    task: Task,
}

/// Owning side of the loop. Runs on the thread that calls [`MainLoop::run`].
pub struct MainLoop {
    receiver: Receiver<Job>,
    current: Arc<Mutex<Option<&'static str>>>,
}

/// Cloneable posting side.
#[derive(Clone)]
pub struct MainLoopHandle {
    sender: Sender<Job>,
    current: Arc<Mutex<Option<&'static str>>>,
}

impl MainLoop {
    pub fn new() -> (MainLoop, MainLoopHandle) {
        let (sender, receiver) = mpsc::channel();
        let current = Arc::new(Mutex::new(None));
        (
            MainLoop {
                receiver,
                current: Arc::clone(&current),
            },
            MainLoopHandle { sender, current },
        )
    }

    /// Runs tasks until every handle is dropped.
    pub fn run(self) {
        while let Ok(job) = self.receiver.recv() {
            self.execute(job);
        }
    }

    /// Runs tasks until `duration` elapses or every handle is dropped.
    pub fn run_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(job) => self.execute(job),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Runs whatever is queued without waiting. Returns how many tasks ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            self.execute(job);
            ran += 1;
        }
        ran
    }

    fn execute(&self, job: Job) {
        set_current(&self.current, Some(job.label));
        (job.task)();
        set_current(&self.current, None);
    }
}

fn set_current(current: &Mutex<Option<&'static str>>, label: Option<&'static str>) {
    *current
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = label;
}

impl MainLoopHandle {
    /// Posts a task under a label that shows up in hang attributions.
    pub fn post_labeled(&self, label: &'static str, task: Task) -> bool {
        self.sender.send(Job { label, task }).is_ok()
    }
}

impl MainContext for MainLoopHandle {
    fn post(&self, task: Task) -> bool {
        self.post_labeled("task", task)
    }

    fn stack_snapshot(&self) -> Option<Stacktrace> {
        let label = (*self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))?;
        Some(Stacktrace {
            frames: vec![StackFrame {
                function: Some(label.to_string()),
                module: Some("main_loop".to_string()),
                in_app: Some(true),
                ..StackFrame::default()
            }],
        })
    }
}
