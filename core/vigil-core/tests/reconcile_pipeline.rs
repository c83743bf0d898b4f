//! End-to-end reconciliation against on-disk envelopes and markers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use fs_err as fs;
use tempfile::TempDir;
use vigil_core::envelope::{encode_event_envelope, read_event_envelope};
use vigil_core::reconcile::{NoPreviousSession, StaticExitHistory};
use vigil_core::{
    OptionsFacet, ReconcileOutcome, StaticDeviceInfo, StorageConfig, VigilConfig, VigilEngine,
};
use vigil_protocol::{
    DiagnosticRef, EnrichedEvent, EventId, Exception, ExitReason, ExitRecord, ProcessImportance,
    ReportCategory,
};

const NOW: i64 = 1_710_000_000_000;
const DAY_MS: i64 = 86_400_000;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn engine(root: &Path, config: VigilConfig) -> VigilEngine {
    VigilEngine::with_parts(
        StorageConfig::with_root(root.to_path_buf()),
        config,
        Arc::new(StaticDeviceInfo::default()),
        Arc::new(NoPreviousSession),
    )
}

fn record(timestamp: i64, reason: ExitReason, diagnostic: Option<DiagnosticRef>) -> ExitRecord {
    ExitRecord {
        timestamp,
        reason,
        importance: ProcessImportance::Foreground,
        pid: Some(4242),
        description: None,
        diagnostic,
    }
}

fn hang(timestamp: i64) -> ExitRecord {
    record(
        timestamp,
        ExitReason::Hang,
        Some(DiagnosticRef::Path(fixture_path("anr_main_blocked.txt"))),
    )
}

fn native(timestamp: i64) -> ExitRecord {
    record(
        timestamp,
        ExitReason::NativeFault,
        Some(DiagnosticRef::Path(fixture_path("tombstone_sigsegv.txt"))),
    )
}

fn events_in(dir: &Path) -> Vec<(PathBuf, EnrichedEvent)> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut events: Vec<(PathBuf, EnrichedEvent)> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .map(|path| {
            let event = read_event_envelope(&path).unwrap();
            (path, event)
        })
        .collect();
    events.sort_by_key(|(_, event)| event.timestamp);
    events
}

/// Reports the pipeline produced, oldest first.
fn reported_events(engine: &VigilEngine) -> Vec<(PathBuf, EnrichedEvent)> {
    events_in(&engine.storage().envelope_cache_dir())
}

fn outcome_for(
    outcomes: &[(ReportCategory, ReconcileOutcome)],
    category: ReportCategory,
) -> &ReconcileOutcome {
    &outcomes
        .iter()
        .find(|(candidate, _)| *candidate == category)
        .unwrap()
        .1
}

#[test]
fn test_historical_hangs_are_reported_oldest_first_then_latest() {
    let temp = TempDir::new().unwrap();
    let mut config = VigilConfig::default();
    config.reconcile.report_historical_hangs = true;
    let engine = engine(temp.path(), config);

    // Newest first, as the OS hands them over.
    let source = StaticExitHistory::new(vec![
        hang(NOW - 60_000),
        record(NOW - 90_000, ExitReason::LowMemory, None),
        hang(NOW - 120_000),
        hang(NOW - 180_000),
    ]);
    let outcomes = engine.reconcile_at(&source, NOW).unwrap();

    let emitted = outcome_for(&outcomes, ReportCategory::Hang).emitted();
    let timestamps: Vec<i64> = emitted.iter().map(|report| report.timestamp).collect();
    assert_eq!(timestamps, vec![NOW - 180_000, NOW - 120_000, NOW - 60_000]);
    assert!(emitted.iter().all(|report| report.accepted() && report.flushed));
    assert!(emitted.last().unwrap().enriched);
    assert!(!emitted[0].enriched);

    assert_eq!(reported_events(&engine).len(), 3);
    assert_eq!(
        engine.marker_store().read(ReportCategory::Hang),
        Some(NOW - 60_000)
    );
}

#[test]
fn test_second_start_reports_nothing_new() {
    let temp = TempDir::new().unwrap();
    let source = StaticExitHistory::new(vec![hang(NOW - 60_000), native(NOW - 30_000)]);

    let first = engine(temp.path(), VigilConfig::default());
    first.reconcile_at(&source, NOW).unwrap();
    let written = reported_events(&first).len();
    assert_eq!(written, 2);

    let second = engine(temp.path(), VigilConfig::default());
    let outcomes = second.reconcile_at(&source, NOW).unwrap();
    for (_, outcome) in &outcomes {
        assert_eq!(*outcome, ReconcileOutcome::NothingNew);
    }
    assert_eq!(reported_events(&second).len(), written);
}

#[test]
fn test_retention_threshold_is_inclusive() {
    let threshold = NOW - VigilConfig::default().reconcile.retention_days * DAY_MS;

    let temp = TempDir::new().unwrap();
    let outcomes = engine(temp.path(), VigilConfig::default())
        .reconcile_at(&StaticExitHistory::new(vec![hang(threshold)]), NOW)
        .unwrap();
    assert_eq!(outcome_for(&outcomes, ReportCategory::Hang).emitted().len(), 1);

    let temp = TempDir::new().unwrap();
    let outcomes = engine(temp.path(), VigilConfig::default())
        .reconcile_at(&StaticExitHistory::new(vec![hang(threshold - 1)]), NOW)
        .unwrap();
    assert_eq!(
        *outcome_for(&outcomes, ReportCategory::Hang),
        ReconcileOutcome::NothingNew
    );
}

#[test]
fn test_unreportable_hang_advances_marker() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), VigilConfig::default());
    let empty_dump = record(
        NOW - 5_000,
        ExitReason::Hang,
        Some(DiagnosticRef::Inline(String::new())),
    );

    let outcomes = engine
        .reconcile_at(&StaticExitHistory::new(vec![empty_dump]), NOW)
        .unwrap();
    assert_eq!(
        *outcome_for(&outcomes, ReportCategory::Hang),
        ReconcileOutcome::Processed {
            emitted: Vec::new(),
            unreportable: 1,
        }
    );
    assert!(reported_events(&engine).is_empty());
    let marker = engine
        .markers()
        .into_iter()
        .find(|marker| marker.category == "hang")
        .unwrap();
    assert_eq!(marker.timestamp_ms, Some(NOW - 5_000));
}

fn write_signal_handler_event(storage: &StorageConfig, timestamp_ms: i64) -> PathBuf {
    let event = EnrichedEvent {
        event_id: Some(EventId::from_u128(7)),
        timestamp: Utc.timestamp_millis_opt(timestamp_ms).single(),
        platform: Some("native".to_string()),
        exceptions: vec![Exception {
            ty: "SIGSEGV".to_string(),
            value: Some("captured in process".to_string()),
            ..Exception::default()
        }],
        ..EnrichedEvent::default()
    };
    fs::create_dir_all(storage.outbox_dir()).unwrap();
    let path = storage.outbox_dir().join("signal-handler.envelope");
    fs::write(&path, encode_event_envelope(&event).unwrap()).unwrap();
    path
}

#[test]
fn test_native_fault_merges_with_nearby_outbox_event() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), VigilConfig::default());
    let original = write_signal_handler_event(engine.storage(), NOW - 30_000 + 2_000);

    let outcomes = engine
        .reconcile_at(&StaticExitHistory::new(vec![native(NOW - 30_000)]), NOW)
        .unwrap();
    assert_eq!(
        outcome_for(&outcomes, ReportCategory::NativeFault)
            .emitted()
            .len(),
        1
    );

    assert!(!original.exists());
    assert!(events_in(engine.storage().outbox_dir()).is_empty());
    let events = reported_events(&engine);
    assert_eq!(events.len(), 1);
    let merged = &events[0].1;
    assert_eq!(
        merged.exceptions[0].value.as_deref(),
        Some("captured in process")
    );
    assert!(!merged.threads.is_empty());
    assert!(!merged.debug_images.is_empty());
}

#[test]
fn test_native_fault_ignores_distant_outbox_event() {
    let temp = TempDir::new().unwrap();
    let engine = engine(temp.path(), VigilConfig::default());
    let original = write_signal_handler_event(engine.storage(), NOW - 30_000 + 10_000);

    engine
        .reconcile_at(&StaticExitHistory::new(vec![native(NOW - 30_000)]), NOW)
        .unwrap();

    assert!(original.exists());
    let events = reported_events(&engine);
    assert_eq!(events.len(), 1);
    let from_tombstone = &events[0].1;
    assert_eq!(
        from_tombstone.exceptions[0].value.as_deref(),
        Some("null pointer dereference")
    );
}

#[test]
fn test_crash_loop_does_not_consume_previous_native_report() {
    let temp = TempDir::new().unwrap();
    let first_crash = NOW - 30_000;

    let first = engine(temp.path(), VigilConfig::default());
    first
        .reconcile_at(&StaticExitHistory::new(vec![native(first_crash)]), NOW)
        .unwrap();
    let after_first = reported_events(&first);
    assert_eq!(after_first.len(), 1);
    let first_report = after_first[0].0.clone();

    // Next start: another native fault 3s later, inside the correlation window.
    let second = engine(temp.path(), VigilConfig::default());
    let outcomes = second
        .reconcile_at(
            &StaticExitHistory::new(vec![native(first_crash + 3_000), native(first_crash)]),
            NOW + 3_000,
        )
        .unwrap();
    assert_eq!(
        outcome_for(&outcomes, ReportCategory::NativeFault)
            .emitted()
            .len(),
        1
    );

    assert!(first_report.exists());
    let events = reported_events(&second);
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[1].1.timestamp.unwrap().timestamp_millis(),
        first_crash + 3_000
    );
    assert_eq!(
        events[1].1.exceptions[0].value.as_deref(),
        Some("null pointer dereference")
    );
}

#[test]
fn test_only_latest_report_is_backfilled_from_snapshots() {
    let temp = TempDir::new().unwrap();
    let mut config = VigilConfig::default();
    config.reconcile.report_historical_hangs = true;
    let engine = engine(temp.path(), config);
    engine
        .snapshot_writer()
        .write_options(OptionsFacet::Release, "com.example@2.1.0+210")
        .unwrap();

    engine
        .reconcile_at(
            &StaticExitHistory::new(vec![hang(NOW - 1_000), hang(NOW - 2_000)]),
            NOW,
        )
        .unwrap();

    let events = reported_events(&engine);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1.release, None);
    assert_eq!(events[1].1.release.as_deref(), Some("com.example@2.1.0+210"));
}
