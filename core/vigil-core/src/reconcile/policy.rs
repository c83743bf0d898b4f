//! Per-category reconciliation policy.

use std::path::PathBuf;

use vigil_protocol::{EnrichedEvent, EnrichmentPolicy, ExitReason, ExitRecord, ReportCategory};

/// An event ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltReport {
    pub event: EnrichedEvent,
    pub policy: EnrichmentPolicy,
    /// Outbox file made redundant by this report, removed once it is accepted.
    pub superseded: Option<PathBuf>,
}

pub trait ReasonPolicy: Send + Sync {
    fn category(&self) -> ReportCategory;

    fn reason(&self) -> ExitReason {
        self.category().reason()
    }

    fn label(&self) -> &'static str {
        self.category().label()
    }

    /// Whether records older than the latest one are reported too.
    fn report_historical(&self) -> bool;

    /// Timestamp of the newest record already reported for this category.
    fn last_reported(&self) -> Option<i64>;

    /// Builds the report for `record`, or `None` when its diagnostic payload
    /// holds nothing reportable.
    fn build_report(&self, record: &ExitRecord, should_enrich: bool) -> Option<BuiltReport>;

    /// Moves the category past a record that will never be reportable, so it
    /// is not retried on every start.
    fn record_unreportable(&self, record: &ExitRecord);
}
