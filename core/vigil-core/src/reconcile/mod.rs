//! Startup reconciliation of the OS exit history.
//!
//! Runs once per category per process, off the main context:
//!
//! 1. wait (bounded) for the previous session to be flushed
//! 2. take the newest record of the category's reason
//! 3. stop if it is outside retention or not newer than the marker
//! 4. optionally report older unreported records, oldest first, with
//!    reduced enrichment
//! 5. report the newest record last, fully enriched
//!
//! Each accepted report is followed by a bounded wait for its flush
//! acknowledgement. The marker itself is advanced by the sink as part of the
//! flush, so a record whose flush was acknowledged is never emitted again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use vigil_protocol::{EventId, ExitRecord, ReportCategory};

use crate::config::ReconcileSettings;
use crate::native::discard_outbox_file;
use crate::sink::{ReportHint, ReportSink};

pub mod hang;
pub mod history;
pub mod native;
pub mod policy;
pub mod session_gate;

pub use hang::HangPolicy;
pub use history::{open_diagnostic, ExitHistorySource, JsonExitHistory, StaticExitHistory};
pub use native::NativeFaultPolicy;
pub use policy::{BuiltReport, ReasonPolicy};
pub use session_gate::{NoPreviousSession, PreviousSessionGate, SessionFlushGate};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedReport {
    /// Exit record timestamp, epoch milliseconds.
    pub timestamp: i64,
    pub event_id: EventId,
    pub enriched: bool,
    /// Whether the flush acknowledgement arrived in time.
    pub flushed: bool,
}

impl EmittedReport {
    pub fn accepted(&self) -> bool {
        !self.event_id.is_nil()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This category was already reconciled in this process.
    AlreadyRan,
    /// No record of the category is newer than the marker and within retention.
    NothingNew,
    Processed {
        emitted: Vec<EmittedReport>,
        unreportable: usize,
    },
}

impl ReconcileOutcome {
    pub fn emitted(&self) -> &[EmittedReport] {
        match self {
            ReconcileOutcome::Processed { emitted, .. } => emitted,
            _ => &[],
        }
    }
}

pub struct ExitHistoryReconciler {
    sink: Arc<dyn ReportSink>,
    gate: Arc<dyn PreviousSessionGate>,
    retention_days: i64,
    session_flush_timeout: Duration,
    gate_passed: AtomicBool,
    completed: Mutex<HashSet<ReportCategory>>,
}

impl ExitHistoryReconciler {
    pub fn new(
        sink: Arc<dyn ReportSink>,
        gate: Arc<dyn PreviousSessionGate>,
        settings: &ReconcileSettings,
    ) -> Self {
        Self {
            sink,
            gate,
            retention_days: settings.retention_days,
            session_flush_timeout: Duration::from_millis(settings.session_flush_timeout_ms),
            gate_passed: AtomicBool::new(false),
            completed: Mutex::new(HashSet::new()),
        }
    }

    /// Oldest timestamp still eligible for reporting at `now`.
    pub fn threshold(&self, now: i64) -> i64 {
        now.saturating_sub(self.retention_days.saturating_mul(MILLIS_PER_DAY))
    }

    pub fn run(&self, records: &[ExitRecord], policy: &dyn ReasonPolicy) -> ReconcileOutcome {
        self.run_at(records, policy, Utc::now().timestamp_millis())
    }

    /// Reconciles `records` for `policy`'s category as of `now` (epoch ms).
    pub fn run_at(
        &self,
        records: &[ExitRecord],
        policy: &dyn ReasonPolicy,
        now: i64,
    ) -> ReconcileOutcome {
        let category = policy.category();
        let first_run = self
            .completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(category);
        if !first_run {
            debug!(category = policy.label(), "Reconciliation already ran");
            return ReconcileOutcome::AlreadyRan;
        }

        self.wait_for_previous_session();

        let reason = policy.reason();
        // OS order is newest first; work chronologically.
        let mut chronological: Vec<&ExitRecord> = records.iter().rev().collect();

        let latest_index = chronological
            .iter()
            .enumerate()
            .filter(|(_, record)| record.reason == reason)
            .max_by_key(|(_, record)| record.timestamp)
            .map(|(index, _)| index);
        let Some(latest_index) = latest_index else {
            debug!(category = policy.label(), "No exit records for category");
            return ReconcileOutcome::NothingNew;
        };
        let latest = chronological.remove(latest_index);

        let threshold = self.threshold(now);
        let marker = policy.last_reported();
        if latest.timestamp < threshold {
            debug!(
                category = policy.label(),
                timestamp = latest.timestamp,
                threshold,
                "Latest exit record is outside retention"
            );
            return ReconcileOutcome::NothingNew;
        }
        if is_reported(latest.timestamp, marker) {
            debug!(
                category = policy.label(),
                timestamp = latest.timestamp,
                marker = ?marker,
                "Latest exit record already reported"
            );
            return ReconcileOutcome::NothingNew;
        }

        let mut emitted = Vec::new();
        let mut unreportable = 0;

        if policy.report_historical() {
            let mut historical: Vec<&ExitRecord> = chronological
                .into_iter()
                .filter(|record| record.reason == reason)
                .filter(|record| {
                    let eligible =
                        record.timestamp >= threshold && !is_reported(record.timestamp, marker);
                    if !eligible {
                        debug!(
                            category = policy.label(),
                            timestamp = record.timestamp,
                            "Skipping historical exit record"
                        );
                    }
                    eligible
                })
                .collect();
            historical.sort_by_key(|record| record.timestamp);

            for record in historical {
                self.emit(policy, record, false, &mut emitted, &mut unreportable);
            }
        }

        self.emit(policy, latest, true, &mut emitted, &mut unreportable);

        info!(
            category = policy.label(),
            emitted = emitted.len(),
            unreportable,
            "Exit history reconciled"
        );
        ReconcileOutcome::Processed {
            emitted,
            unreportable,
        }
    }

    fn wait_for_previous_session(&self) {
        if self.gate_passed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self
            .gate
            .wait_previous_session_flush(self.session_flush_timeout)
        {
            warn!(
                timeout_ms = self.session_flush_timeout.as_millis() as u64,
                "Timed out waiting to flush previous session"
            );
            self.gate.flush_previous_session();
        }
    }

    fn emit(
        &self,
        policy: &dyn ReasonPolicy,
        record: &ExitRecord,
        should_enrich: bool,
        emitted: &mut Vec<EmittedReport>,
        unreportable: &mut usize,
    ) {
        let Some(report) = policy.build_report(record, should_enrich) else {
            info!(
                category = policy.label(),
                timestamp = record.timestamp,
                "Exit record has no actionable data, skipping"
            );
            policy.record_unreportable(record);
            *unreportable += 1;
            return;
        };

        let superseded = report.superseded;
        let hint = ReportHint::new(report.policy);
        let event_id = self.sink.capture(report.event, &hint);

        if event_id.is_nil() {
            debug!(
                category = policy.label(),
                timestamp = record.timestamp,
                "Report suppressed by sink"
            );
            emitted.push(EmittedReport {
                timestamp: record.timestamp,
                event_id,
                enriched: should_enrich,
                flushed: false,
            });
            return;
        }

        let flushed = hint.policy.flush_timeout_ms == 0 || hint.wait_flushed();
        if !flushed {
            warn!(
                category = policy.label(),
                event_id = %event_id,
                timeout_ms = hint.policy.flush_timeout_ms,
                "Timed out waiting for report flush"
            );
        }
        if let Some(path) = superseded {
            discard_outbox_file(&path);
        }

        info!(
            category = policy.label(),
            timestamp = record.timestamp,
            event_id = %event_id,
            historical = !should_enrich,
            "Reported exit record"
        );
        emitted.push(EmittedReport {
            timestamp: record.timestamp,
            event_id,
            enriched: should_enrich,
            flushed,
        });
    }
}

fn is_reported(timestamp: i64, marker: Option<i64>) -> bool {
    marker.map(|marker| timestamp <= marker).unwrap_or(false)
}
