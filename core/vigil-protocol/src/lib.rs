//! Schema types shared by the vigil crash pipeline.
//!
//! This crate is shared by the library, the agent binary and OS adapters so
//! that exit records and events are described in exactly one place. The
//! pipeline remains the authority on validation, but adapters can reuse the
//! same types to construct valid exit histories.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod event;

pub use event::{
    AppContext, Breadcrumb, Contexts, DebugImage, DeviceContext, EnrichedEvent, EventId,
    Exception, Level, LockKind, LockReason, Mechanism, OsContext, Request, Sdk, StackFrame,
    Stacktrace, Thread, TraceContext, User, APP_CONTEXT_KEY, DEVICE_CONTEXT_KEY, OS_CONTEXT_KEY,
    TRACE_CONTEXT_KEY,
};

pub const SCHEMA_VERSION: u32 = 1;
pub const MAX_HISTORY_RECORDS: usize = 1024;

/// Why a past process instance terminated, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Hang,
    NativeFault,
    Crash,
    LowMemory,
    Signaled,
    ExitSelf,
    UserRequested,
    #[serde(other)]
    Other,
}

/// Process importance at the moment of exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessImportance {
    Foreground,
    Visible,
    Perceptible,
    Service,
    Cached,
    #[default]
    Gone,
}

/// Handle to the raw diagnostic stream attached to an exit record.
///
/// The stream is either a thread-state dump (hangs) or a native fault trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticRef {
    Path(PathBuf),
    Inline(String),
}

/// OS-retained metadata about a terminated process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitRecord {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub reason: ExitReason,
    #[serde(default)]
    pub importance: ProcessImportance,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub diagnostic: Option<DiagnosticRef>,
}

impl ExitRecord {
    pub fn is_foreground(&self) -> bool {
        self.importance == ProcessImportance::Foreground
    }

    pub fn is_background(&self) -> bool {
        !self.is_foreground()
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.timestamp <= 0 {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "timestamp must be positive epoch milliseconds",
            ));
        }
        if let Some(pid) = self.pid {
            if pid == 0 {
                return Err(ErrorInfo::new("invalid_pid", "pid must be non-zero"));
            }
        }
        match &self.diagnostic {
            Some(DiagnosticRef::Path(path)) if path.as_os_str().is_empty() => Err(
                ErrorInfo::new("invalid_diagnostic", "diagnostic path must not be empty"),
            ),
            _ => Ok(()),
        }
    }
}

/// The reason categories the pipeline deduplicates independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportCategory {
    Hang,
    NativeFault,
}

impl ReportCategory {
    pub const ALL: [ReportCategory; 2] = [ReportCategory::Hang, ReportCategory::NativeFault];

    pub fn reason(self) -> ExitReason {
        match self {
            ReportCategory::Hang => ExitReason::Hang,
            ReportCategory::NativeFault => ExitReason::NativeFault,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReportCategory::Hang => "hang",
            ReportCategory::NativeFault => "native_fault",
        }
    }
}

/// Marks a report as describing an abnormal exit of a previous process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnormalExit {
    pub category: ReportCategory,
    /// Timestamp of the exit record, epoch milliseconds.
    pub timestamp: i64,
}

/// Capabilities attached to a report on its way to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnrichmentPolicy {
    /// Backfill scope and options snapshots.
    pub should_enrich: bool,
    pub is_historical: bool,
    pub is_background: bool,
    /// Zero means the caller does not wait for the flush acknowledgement.
    pub flush_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormal_exit: Option<AbnormalExit>,
}

impl EnrichmentPolicy {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn for_exit(
        record: &ExitRecord,
        category: ReportCategory,
        should_enrich: bool,
        flush_timeout_ms: u64,
    ) -> Self {
        Self {
            should_enrich,
            is_historical: !should_enrich,
            is_background: record.is_background(),
            flush_timeout_ms,
            abnormal_exit: Some(AbnormalExit {
                category,
                timestamp: record.timestamp,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// On-disk/serialized exit history document.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ExitHistory {
    pub version: u32,
    #[serde(default)]
    pub records: Vec<ExitRecord>,
}

/// Parses and validates an exit history document.
///
/// Invalid individual records are dropped rather than failing the whole
/// history; the caller gets the rejected count back for logging.
pub fn parse_exit_history(document: Value) -> Result<(Vec<ExitRecord>, usize), ErrorInfo> {
    let history: ExitHistory = serde_json::from_value(document).map_err(|err| {
        ErrorInfo::new(
            "invalid_history",
            format!("exit history is invalid JSON: {}", err),
        )
    })?;

    if history.version != SCHEMA_VERSION {
        return Err(ErrorInfo::new(
            "unsupported_version",
            format!(
                "exit history version {} is not supported (expected {})",
                history.version, SCHEMA_VERSION
            ),
        ));
    }

    let mut rejected = 0;
    let records: Vec<ExitRecord> = history
        .records
        .into_iter()
        .take(MAX_HISTORY_RECORDS)
        .filter(|record| {
            let valid = record.validate().is_ok();
            if !valid {
                rejected += 1;
            }
            valid
        })
        .collect();

    Ok((records, rejected))
}
