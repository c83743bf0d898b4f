//! Policy for hang exit records.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{info, warn};
use vigil_protocol::{EnrichedEvent, EnrichmentPolicy, ExitRecord, Level, ReportCategory};

use super::history::open_diagnostic;
use super::policy::{BuiltReport, ReasonPolicy};
use crate::enrich::DeferredEventEnricher;
use crate::markers::MarkerStore;
use crate::parse::{parse_thread_dump, ThreadDumpOutcome};
use crate::watchdog::{HangError, HangSource};

pub const DEFAULT_HANG_MESSAGE: &str = "Application Not Responding";
pub const UNRECOGNIZED_DUMP_MESSAGE: &str =
    "Application Not Responding; the thread dump could not be parsed";
const MAX_RAW_DUMP_CHARS: usize = 16 * 1024;

pub struct HangPolicy {
    markers: Arc<MarkerStore>,
    enricher: Arc<DeferredEventEnricher>,
    report_historical: bool,
    flush_timeout_ms: u64,
}

impl HangPolicy {
    pub fn new(
        markers: Arc<MarkerStore>,
        enricher: Arc<DeferredEventEnricher>,
        report_historical: bool,
        flush_timeout_ms: u64,
    ) -> Self {
        Self {
            markers,
            enricher,
            report_historical,
            flush_timeout_ms,
        }
    }

    fn event_from_dump(&self, record: &ExitRecord, text: &str) -> Option<EnrichedEvent> {
        match parse_thread_dump(text) {
            ThreadDumpOutcome::NoDump => {
                info!(timestamp = record.timestamp, "Hang record has an empty thread dump");
                None
            }
            ThreadDumpOutcome::NoActionableData => {
                info!(timestamp = record.timestamp, "Hang thread dump has no actionable frames");
                None
            }
            ThreadDumpOutcome::Unrecognized => {
                warn!(timestamp = record.timestamp, "Hang thread dump not recognized");
                let raw: String = text.chars().take(MAX_RAW_DUMP_CHARS).collect();
                let mut extra = std::collections::BTreeMap::new();
                extra.insert("thread_dump".to_string(), json!(raw));
                Some(EnrichedEvent {
                    message: Some(UNRECOGNIZED_DUMP_MESSAGE.to_string()),
                    extra: Some(extra),
                    ..EnrichedEvent::default()
                })
            }
            ThreadDumpOutcome::Dump(dump) => {
                let main = dump.main_thread()?.clone();
                let message = record
                    .description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HANG_MESSAGE.to_string());
                let exception =
                    HangError::new(message, HangSource::ExitHistory, record.is_background(), main)
                        .to_exception();
                let mut event = EnrichedEvent {
                    exceptions: vec![exception],
                    threads: dump.threads,
                    ..EnrichedEvent::default()
                };
                event.add_debug_images(dump.debug_images);
                Some(event)
            }
        }
    }
}

impl ReasonPolicy for HangPolicy {
    fn category(&self) -> ReportCategory {
        ReportCategory::Hang
    }

    fn report_historical(&self) -> bool {
        self.report_historical
    }

    fn last_reported(&self) -> Option<i64> {
        self.markers.read(ReportCategory::Hang)
    }

    fn build_report(&self, record: &ExitRecord, should_enrich: bool) -> Option<BuiltReport> {
        let Some(diagnostic) = &record.diagnostic else {
            info!(timestamp = record.timestamp, "Hang record has no thread dump");
            return None;
        };
        let text = match open_diagnostic(diagnostic) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, timestamp = record.timestamp, "Failed to read thread dump");
                return None;
            }
        };

        let mut event = self.event_from_dump(record, &text)?;
        event.timestamp = Utc.timestamp_millis_opt(record.timestamp).single();
        event.level.get_or_insert(Level::Error);

        let policy = EnrichmentPolicy::for_exit(
            record,
            ReportCategory::Hang,
            should_enrich,
            self.flush_timeout_ms,
        );
        self.enricher.enrich(&mut event, &policy);

        Some(BuiltReport {
            event,
            policy,
            superseded: None,
        })
    }

    fn record_unreportable(&self, record: &ExitRecord) {
        if let Err(err) = self.markers.advance(ReportCategory::Hang, record.timestamp) {
            warn!(error = %err, "Failed to advance hang marker past unreportable record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vigil_protocol::{DiagnosticRef, ExitReason, ProcessImportance};

    use crate::config::AppSettings;
    use crate::device::StaticDeviceInfo;
    use crate::storage::StorageConfig;
    use crate::watchdog::HANG_EXCEPTION_TYPE;

    const DUMP: &str = "\"main\" prio=5 tid=1 Blocked\n  at com.example.Worker.run(Worker.java:42)\n";

    fn policy(storage: &StorageConfig) -> HangPolicy {
        let markers = Arc::new(MarkerStore::new(storage.clone()));
        let enricher = Arc::new(DeferredEventEnricher::new(
            storage,
            AppSettings::default(),
            Arc::new(StaticDeviceInfo::default()),
        ));
        HangPolicy::new(markers, enricher, false, 0)
    }

    fn record(diagnostic: Option<&str>, importance: ProcessImportance) -> ExitRecord {
        ExitRecord {
            timestamp: 1_700_000_000_000,
            reason: ExitReason::Hang,
            importance,
            pid: Some(1),
            description: None,
            diagnostic: diagnostic.map(|text| DiagnosticRef::Inline(text.to_string())),
        }
    }

    #[test]
    fn dump_becomes_hang_exception_on_main_thread() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let report = policy(&storage)
            .build_report(&record(Some(DUMP), ProcessImportance::Foreground), true)
            .unwrap();

        let exception = &report.event.exceptions[0];
        assert_eq!(exception.ty, HANG_EXCEPTION_TYPE);
        assert_eq!(exception.thread_id, Some(1));
        assert_eq!(exception.mechanism.as_ref().unwrap().ty, "AppExitInfo");
        assert_eq!(
            report.event.timestamp.unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert_eq!(report.event.fingerprint.as_ref().unwrap()[1], "foreground-anr");
        assert!(report.policy.should_enrich);
    }

    #[test]
    fn background_record_is_marked_background() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let report = policy(&storage)
            .build_report(&record(Some(DUMP), ProcessImportance::Cached), true)
            .unwrap();
        assert!(report.policy.is_background);
        assert!(report.event.exceptions[0]
            .value
            .as_deref()
            .unwrap()
            .starts_with("Background"));
    }

    #[test]
    fn missing_or_empty_dump_is_unreportable() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let policy = policy(&storage);
        assert!(policy
            .build_report(&record(None, ProcessImportance::Foreground), true)
            .is_none());
        assert!(policy
            .build_report(&record(Some(""), ProcessImportance::Foreground), true)
            .is_none());
    }

    #[test]
    fn unrecognized_dump_is_reported_with_message() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let report = policy(&storage)
            .build_report(&record(Some("??"), ProcessImportance::Foreground), false)
            .unwrap();
        assert_eq!(report.event.message.as_deref(), Some(UNRECOGNIZED_DUMP_MESSAGE));
        assert!(report.event.exceptions.is_empty());
        assert!(report.policy.is_historical);
    }

    #[test]
    fn unreportable_record_advances_marker() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let policy = policy(&storage);
        policy.record_unreportable(&record(None, ProcessImportance::Foreground));
        assert_eq!(policy.last_reported(), Some(1_700_000_000_000));
    }
}
