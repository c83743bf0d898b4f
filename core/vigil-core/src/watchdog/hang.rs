//! The synthetic fault describing an unresponsive main context.

use std::collections::BTreeMap;

use serde_json::json;
use vigil_protocol::{EnrichedEvent, Exception, Level, Mechanism, Thread};

pub const HANG_EXCEPTION_TYPE: &str = "ApplicationNotResponding";

/// Where the hang was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangSource {
    /// Live, by the in-process watchdog.
    Watchdog,
    /// After the fact, from the OS exit history.
    ExitHistory,
}

impl HangSource {
    pub fn mechanism_type(self) -> &'static str {
        match self {
            HangSource::Watchdog => "ANR",
            HangSource::ExitHistory => "AppExitInfo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HangError {
    pub message: String,
    pub source_kind: HangSource,
    pub background: bool,
    /// The thread the hang is attributed to, usually the main thread.
    pub thread: Thread,
}

impl HangError {
    pub fn new(
        message: impl Into<String>,
        source_kind: HangSource,
        background: bool,
        thread: Thread,
    ) -> Self {
        Self {
            message: message.into(),
            source_kind,
            background,
            thread,
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        let mut data = BTreeMap::new();
        data.insert("background".to_string(), json!(self.background));
        Mechanism {
            ty: self.source_kind.mechanism_type().to_string(),
            description: None,
            handled: Some(false),
            synthetic: Some(true),
            data,
        }
    }

    pub fn to_exception(&self) -> Exception {
        let value = if self.background {
            format!("Background {}", self.message)
        } else {
            self.message.clone()
        };
        Exception {
            ty: HANG_EXCEPTION_TYPE.to_string(),
            value: Some(value),
            module: None,
            thread_id: Some(self.thread.id),
            stacktrace: self.thread.stacktrace.clone(),
            mechanism: Some(self.mechanism()),
        }
    }

    /// Event carrying this hang as its exception plus the attributed thread.
    pub fn into_event(self) -> EnrichedEvent {
        let exception = self.to_exception();
        let mut thread = self.thread;
        thread.crashed = true;
        thread.current = true;
        EnrichedEvent {
            level: Some(Level::Error),
            exceptions: vec![exception],
            threads: vec![thread],
            ..EnrichedEvent::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_protocol::{StackFrame, Stacktrace};

    fn main_thread() -> Thread {
        Thread {
            id: 1,
            name: Some("main".to_string()),
            main: true,
            stacktrace: Some(Stacktrace {
                frames: vec![StackFrame {
                    function: Some("onDraw".to_string()),
                    ..StackFrame::default()
                }],
            }),
            ..Thread::default()
        }
    }

    #[test]
    fn exception_carries_type_stack_and_mechanism() {
        let error = HangError::new("stuck", HangSource::Watchdog, false, main_thread());
        let exception = error.to_exception();
        assert_eq!(exception.ty, HANG_EXCEPTION_TYPE);
        assert_eq!(exception.value.as_deref(), Some("stuck"));
        assert_eq!(exception.thread_id, Some(1));
        assert_eq!(exception.stacktrace.unwrap().frames.len(), 1);
        let mechanism = exception.mechanism.unwrap();
        assert_eq!(mechanism.ty, "ANR");
        assert_eq!(mechanism.data["background"], false);
    }

    #[test]
    fn background_hangs_are_labeled() {
        let error = HangError::new("stuck", HangSource::ExitHistory, true, main_thread());
        let exception = error.to_exception();
        assert_eq!(exception.value.as_deref(), Some("Background stuck"));
        assert_eq!(exception.mechanism.unwrap().ty, "AppExitInfo");
    }

    #[test]
    fn event_marks_attributed_thread_crashed() {
        let event = HangError::new("stuck", HangSource::Watchdog, false, main_thread()).into_event();
        assert_eq!(event.exceptions.len(), 1);
        assert!(event.threads[0].crashed);
        assert_eq!(event.level, Some(Level::Error));
    }
}
