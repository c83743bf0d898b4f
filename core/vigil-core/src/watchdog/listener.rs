//! Receivers of live hang reports.

use std::sync::Arc;

use tracing::info;
use vigil_protocol::EnrichmentPolicy;

use super::hang::HangError;
use crate::sink::{ReportHint, ReportSink};

pub trait HangListener: Send + Sync {
    fn on_hang(&self, error: HangError);
}

/// Captures live hangs through a report sink.
pub struct SinkHangListener {
    sink: Arc<dyn ReportSink>,
}

impl SinkHangListener {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }
}

impl HangListener for SinkHangListener {
    fn on_hang(&self, error: HangError) {
        let policy = EnrichmentPolicy {
            is_background: error.background,
            ..EnrichmentPolicy::live()
        };
        let message = error.message.clone();
        let id = self
            .sink
            .capture(error.into_event(), &ReportHint::new(policy));
        info!(event_id = %id, message = %message, "Live hang reported");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vigil_protocol::{EnrichedEvent, EventId, Thread};

    use crate::watchdog::hang::{HangSource, HANG_EXCEPTION_TYPE};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(EnrichedEvent, EnrichmentPolicy)>>,
    }

    impl ReportSink for RecordingSink {
        fn capture(&self, event: EnrichedEvent, hint: &ReportHint) -> EventId {
            self.events
                .lock()
                .unwrap()
                .push((event, hint.policy.clone()));
            EventId::from_u128(1)
        }
    }

    #[test]
    fn hang_is_captured_as_live_event() {
        let sink = Arc::new(RecordingSink::default());
        let listener = SinkHangListener::new(sink.clone());
        listener.on_hang(HangError::new(
            "stuck",
            HangSource::Watchdog,
            true,
            Thread::default(),
        ));

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (event, policy) = &events[0];
        assert_eq!(event.exceptions[0].ty, HANG_EXCEPTION_TYPE);
        assert!(policy.abnormal_exit.is_none());
        assert!(policy.is_background);
    }
}
