//! Reporting sink and flush acknowledgement.
//!
//! The reconciler hands each built event to a [`ReportSink`] together with a
//! [`ReportHint`]. The hint carries the event's [`EnrichmentPolicy`] and a
//! [`FlushLatch`] the sink signals once the event is durably written. The
//! reconciler blocks on that latch for at most `flush_timeout_ms`.
//!
//! [`EnvelopeSink`] is the on-disk implementation. Its order of operations is
//! what makes reporting crash-safe:
//!
//! 1. write the envelope into the envelope cache (temp file + rename)
//! 2. advance the category marker to the exit record's timestamp
//! 3. signal the latch
//!
//! A crash between 1 and 2 leaves the event in the cache with the marker
//! behind it, so the record is reported again on the next start.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use ulid::Ulid;
use vigil_protocol::{EnrichedEvent, EnrichmentPolicy, EventId};

use crate::envelope::encode_event_envelope;
use crate::files::write_atomically;
use crate::markers::MarkerStore;
use crate::storage::StorageConfig;

pub const ENVELOPE_EXTENSION: &str = "envelope";

// ═══════════════════════════════════════════════════════════════════════════════
// Flush latch
// ═══════════════════════════════════════════════════════════════════════════════

/// One-shot signal from the sink back to whoever submitted an event.
#[derive(Debug, Default)]
pub struct FlushLatch {
    flushed: Mutex<bool>,
    cond: Condvar,
}

impl FlushLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        let mut flushed = self
            .flushed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *flushed = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self
            .flushed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until signaled or until `timeout` elapses. Returns whether the
    /// latch was signaled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flushed = self
            .flushed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*flushed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(flushed, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            flushed = guard;
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ReportHint {
    pub policy: EnrichmentPolicy,
    pub flush: Arc<FlushLatch>,
}

impl ReportHint {
    pub fn new(policy: EnrichmentPolicy) -> Self {
        Self {
            policy,
            flush: FlushLatch::new(),
        }
    }

    /// Waits for the flush acknowledgement using the policy's timeout.
    pub fn wait_flushed(&self) -> bool {
        self.flush
            .wait(Duration::from_millis(self.policy.flush_timeout_ms))
    }
}

pub trait ReportSink: Send + Sync {
    /// Submits an event. Returns the assigned id, or the nil id when the
    /// event was suppressed or could not be stored.
    fn capture(&self, event: EnrichedEvent, hint: &ReportHint) -> EventId;
}

/// Local suppression hook. Returning `false` drops the event.
pub type EventFilter = Box<dyn Fn(&EnrichedEvent, &EnrichmentPolicy) -> bool + Send + Sync>;

pub struct EnvelopeSink {
    dir: PathBuf,
    markers: Arc<MarkerStore>,
    filter: Option<EventFilter>,
}

impl EnvelopeSink {
    pub fn new(storage: &StorageConfig, markers: Arc<MarkerStore>) -> Self {
        Self {
            dir: storage.envelope_cache_dir(),
            markers,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn envelope_path(&self, id: &EventId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", id.as_str(), ENVELOPE_EXTENSION))
    }
}

impl ReportSink for EnvelopeSink {
    fn capture(&self, mut event: EnrichedEvent, hint: &ReportHint) -> EventId {
        if let Some(filter) = &self.filter {
            if !filter(&event, &hint.policy) {
                debug!("Event suppressed by filter");
                return EventId::nil();
            }
        }

        let id = event
            .event_id
            .clone()
            .filter(|id| !id.is_nil())
            .unwrap_or_else(|| EventId::from_u128(Ulid::new().0));
        event.event_id = Some(id.clone());
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let path = self.envelope_path(&id);
        let written = encode_event_envelope(&event).and_then(|bytes| write_atomically(&path, &bytes));
        if let Err(err) = written {
            warn!(error = %err, path = %path.display(), "Failed to store event");
            return EventId::nil();
        }

        if let Some(exit) = hint.policy.abnormal_exit {
            if let Err(err) = self.markers.advance(exit.category, exit.timestamp) {
                warn!(
                    error = %err,
                    category = exit.category.label(),
                    timestamp = exit.timestamp,
                    "Failed to advance marker after flush"
                );
            }
        }

        hint.flush.signal();
        info!(event_id = %id, path = %path.display(), "Event stored");
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;
    use vigil_protocol::{ExitReason, ExitRecord, ProcessImportance, ReportCategory};

    use crate::envelope::read_event_envelope;

    fn record(timestamp: i64) -> ExitRecord {
        ExitRecord {
            timestamp,
            reason: ExitReason::Hang,
            importance: ProcessImportance::Foreground,
            pid: None,
            description: None,
            diagnostic: None,
        }
    }

    #[test]
    fn latch_wait_times_out_without_signal() {
        let latch = FlushLatch::new();
        assert!(!latch.wait(Duration::from_millis(10)));
    }

    #[test]
    fn latch_wakes_waiter_from_another_thread() {
        let latch = FlushLatch::new();
        let signaler = Arc::clone(&latch);
        let handle = thread::spawn(move || signaler.signal());
        assert!(latch.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(latch.is_signaled());
    }

    #[test]
    fn sink_writes_envelope_advances_marker_and_signals() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let markers = Arc::new(MarkerStore::new(storage.clone()));
        let sink = EnvelopeSink::new(&storage, Arc::clone(&markers));

        let policy = EnrichmentPolicy::for_exit(&record(500), ReportCategory::Hang, true, 1000);
        let hint = ReportHint::new(policy);
        let id = sink.capture(EnrichedEvent::default(), &hint);

        assert!(!id.is_nil());
        assert!(hint.flush.is_signaled());
        assert_eq!(markers.read(ReportCategory::Hang), Some(500));

        let stored = read_event_envelope(&sink.envelope_path(&id)).unwrap();
        assert_eq!(stored.event_id, Some(id.clone()));
        assert!(stored.timestamp.is_some());
        assert!(sink.envelope_path(&id).starts_with(storage.envelope_cache_dir()));
        assert!(!storage.outbox_dir().exists());
    }

    #[test]
    fn live_events_do_not_touch_markers() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let markers = Arc::new(MarkerStore::new(storage.clone()));
        let sink = EnvelopeSink::new(&storage, Arc::clone(&markers));

        let id = sink.capture(EnrichedEvent::default(), &ReportHint::new(EnrichmentPolicy::live()));
        assert!(!id.is_nil());
        assert_eq!(markers.read(ReportCategory::Hang), None);
    }

    #[test]
    fn filtered_events_return_nil_and_keep_marker() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let markers = Arc::new(MarkerStore::new(storage.clone()));
        let sink = EnvelopeSink::new(&storage, Arc::clone(&markers))
            .with_filter(Box::new(|_, policy| !policy.is_historical));

        let policy = EnrichmentPolicy::for_exit(&record(700), ReportCategory::Hang, false, 0);
        let hint = ReportHint::new(policy);
        let id = sink.capture(EnrichedEvent::default(), &hint);

        assert!(id.is_nil());
        assert!(!hint.flush.is_signaled());
        assert_eq!(markers.read(ReportCategory::Hang), None);
    }
}
