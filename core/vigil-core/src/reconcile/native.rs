//! Policy for native fault exit records.
//!
//! The OS tombstone and the in-process signal handler's outbox event
//! describe the same fault. When both exist they are merged: the outbox
//! event is the base (it was built with full in-process knowledge) and the
//! tombstone fills what it lacks.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing::{info, warn};
use vigil_protocol::{EnrichedEvent, EnrichmentPolicy, ExitRecord, Level, ReportCategory};

use super::history::open_diagnostic;
use super::policy::{BuiltReport, ReasonPolicy};
use crate::enrich::DeferredEventEnricher;
use crate::markers::MarkerStore;
use crate::native::{NativeEventCorrelator, NATIVE_PLATFORM};
use crate::parse::{parse_tombstone, Tombstone};

pub struct NativeFaultPolicy {
    markers: Arc<MarkerStore>,
    enricher: Arc<DeferredEventEnricher>,
    correlator: Option<Arc<NativeEventCorrelator>>,
    report_historical: bool,
    flush_timeout_ms: u64,
}

impl NativeFaultPolicy {
    pub fn new(
        markers: Arc<MarkerStore>,
        enricher: Arc<DeferredEventEnricher>,
        correlator: Option<Arc<NativeEventCorrelator>>,
        report_historical: bool,
        flush_timeout_ms: u64,
    ) -> Self {
        Self {
            markers,
            enricher,
            correlator,
            report_historical,
            flush_timeout_ms,
        }
    }

    fn tombstone(&self, record: &ExitRecord) -> Option<Tombstone> {
        let diagnostic = record.diagnostic.as_ref()?;
        let text = match open_diagnostic(diagnostic) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, timestamp = record.timestamp, "Failed to read native trace");
                return None;
            }
        };
        let tombstone = parse_tombstone(&text);
        if tombstone.is_none() {
            info!(timestamp = record.timestamp, "Native trace not recognized");
        }
        tombstone
    }
}

fn merge_tombstone(event: &mut EnrichedEvent, tombstone: Tombstone) {
    if event.exceptions.is_empty() {
        event.exceptions.push(tombstone.exception());
    }
    if event.threads.is_empty() {
        event.threads = tombstone.threads;
    }
    event.add_debug_images(tombstone.debug_images);
}

impl ReasonPolicy for NativeFaultPolicy {
    fn category(&self) -> ReportCategory {
        ReportCategory::NativeFault
    }

    fn report_historical(&self) -> bool {
        self.report_historical
    }

    fn last_reported(&self) -> Option<i64> {
        self.markers.read(ReportCategory::NativeFault)
    }

    fn build_report(&self, record: &ExitRecord, should_enrich: bool) -> Option<BuiltReport> {
        let tombstone = self.tombstone(record);
        let correlated = self
            .correlator
            .as_ref()
            .and_then(|correlator| correlator.find_match(record.timestamp));

        if tombstone.is_none() && correlated.is_none() {
            info!(timestamp = record.timestamp, "Native fault record has nothing to report");
            return None;
        }

        let (mut event, superseded) = match correlated {
            Some(correlated) => {
                info!(
                    timestamp = record.timestamp,
                    path = %correlated.path.display(),
                    "Merging native fault with outbox event"
                );
                let mut event = correlated.event;
                // Stored again under a new id; the original file is removed.
                event.event_id = None;
                (event, Some(correlated.path))
            }
            None => (EnrichedEvent::default(), None),
        };
        if let Some(tombstone) = tombstone {
            merge_tombstone(&mut event, tombstone);
        }

        event
            .platform
            .get_or_insert_with(|| NATIVE_PLATFORM.to_string());
        if event.timestamp.is_none() {
            event.timestamp = Utc.timestamp_millis_opt(record.timestamp).single();
        }
        event.level.get_or_insert(Level::Fatal);

        let policy = EnrichmentPolicy::for_exit(
            record,
            ReportCategory::NativeFault,
            should_enrich,
            self.flush_timeout_ms,
        );
        self.enricher.enrich(&mut event, &policy);

        Some(BuiltReport {
            event,
            policy,
            superseded,
        })
    }

    fn record_unreportable(&self, record: &ExitRecord) {
        if let Err(err) = self
            .markers
            .advance(ReportCategory::NativeFault, record.timestamp)
        {
            warn!(error = %err, "Failed to advance native fault marker past unreportable record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_err as fs;
    use tempfile::tempdir;
    use vigil_protocol::{DiagnosticRef, EventId, ExitReason, Exception, ProcessImportance};

    use crate::config::AppSettings;
    use crate::device::StaticDeviceInfo;
    use crate::envelope::encode_event_envelope;
    use crate::storage::StorageConfig;

    const TS: i64 = 1_700_000_000_000;
    const TOMBSTONE: &str = "pid: 7, tid: 7, name: example  >>> com.example <<<\nsignal 6 (SIGABRT), code -1 (SI_QUEUE), fault addr --------\nbacktrace:\n      #00 pc 0000000000001000  /data/app/libgame.so (boom+4) (BuildId: aa)\n";

    fn policy(storage: &StorageConfig, correlate: bool) -> NativeFaultPolicy {
        let markers = Arc::new(MarkerStore::new(storage.clone()));
        let enricher = Arc::new(DeferredEventEnricher::new(
            storage,
            AppSettings::default(),
            Arc::new(StaticDeviceInfo::default()),
        ));
        let correlator = correlate
            .then(|| Arc::new(NativeEventCorrelator::new(storage.outbox_dir(), 5_000)));
        NativeFaultPolicy::new(markers, enricher, correlator, false, 0)
    }

    fn record(diagnostic: Option<&str>) -> ExitRecord {
        ExitRecord {
            timestamp: TS,
            reason: ExitReason::NativeFault,
            importance: ProcessImportance::Foreground,
            pid: Some(7),
            description: None,
            diagnostic: diagnostic.map(|text| DiagnosticRef::Inline(text.to_string())),
        }
    }

    fn write_outbox_event(storage: &StorageConfig, offset_ms: i64) -> std::path::PathBuf {
        let event = EnrichedEvent {
            event_id: Some(EventId::from_u128(99)),
            timestamp: Utc.timestamp_millis_opt(TS + offset_ms).single(),
            platform: Some(NATIVE_PLATFORM.to_string()),
            exceptions: vec![Exception {
                ty: "SIGSEGV".to_string(),
                value: Some("from signal handler".to_string()),
                ..Exception::default()
            }],
            ..EnrichedEvent::default()
        };
        fs::create_dir_all(storage.outbox_dir()).unwrap();
        let path = storage.outbox_dir().join("native.envelope");
        fs::write(&path, encode_event_envelope(&event).unwrap()).unwrap();
        path
    }

    #[test]
    fn tombstone_alone_builds_native_event() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let report = policy(&storage, true)
            .build_report(&record(Some(TOMBSTONE)), true)
            .unwrap();

        assert_eq!(report.event.platform.as_deref(), Some(NATIVE_PLATFORM));
        assert_eq!(report.event.exceptions[0].ty, "SIGABRT");
        assert_eq!(report.event.level, Some(Level::Fatal));
        assert!(report.superseded.is_none());
    }

    #[test]
    fn correlated_outbox_event_is_the_base() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let path = write_outbox_event(&storage, 2_000);

        let report = policy(&storage, true)
            .build_report(&record(Some(TOMBSTONE)), true)
            .unwrap();

        assert_eq!(report.superseded, Some(path));
        assert_eq!(report.event.exceptions.len(), 1);
        assert_eq!(
            report.event.exceptions[0].value.as_deref(),
            Some("from signal handler")
        );
        assert_eq!(report.event.threads.len(), 1);
        assert!(report.event.event_id.is_none());
        assert_eq!(
            report.event.timestamp.unwrap().timestamp_millis(),
            TS + 2_000
        );
    }

    #[test]
    fn distant_outbox_event_is_not_merged() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        write_outbox_event(&storage, 10_000);

        let report = policy(&storage, true)
            .build_report(&record(Some(TOMBSTONE)), true)
            .unwrap();
        assert!(report.superseded.is_none());
        assert_eq!(report.event.exceptions[0].ty, "SIGABRT");
    }

    #[test]
    fn nothing_to_report_without_trace_or_match() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        assert!(policy(&storage, false)
            .build_report(&record(None), true)
            .is_none());
    }
}
