//! Sources of OS exit history and their diagnostic payloads.

use std::path::PathBuf;

use fs_err as fs;
use serde_json::Value;
use tracing::{debug, warn};
use vigil_protocol::{parse_exit_history, DiagnosticRef, ExitRecord};

use crate::error::{Result, VigilError};
use crate::files::read_optional;

/// Enumerates exit records on demand. Platform adapters implement this over
/// the OS query; the order of the returned records is not relied upon.
pub trait ExitHistorySource: Send + Sync {
    fn exit_records(&self) -> Result<Vec<ExitRecord>>;
}

/// Exit history stored as a JSON document (`{"version":1,"records":[...]}`).
#[derive(Debug, Clone)]
pub struct JsonExitHistory {
    path: PathBuf,
}

impl JsonExitHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ExitHistorySource for JsonExitHistory {
    fn exit_records(&self) -> Result<Vec<ExitRecord>> {
        let Some(bytes) = read_optional(&self.path)? else {
            debug!(path = %self.path.display(), "No exit history file");
            return Ok(Vec::new());
        };
        let document: Value = serde_json::from_slice(&bytes)
            .map_err(|err| VigilError::json(format!("parsing {}", self.path.display()), err))?;
        records_from_document(document)
    }
}

/// Exit history already in memory, e.g. handed over by a mobile host.
#[derive(Debug, Clone, Default)]
pub struct StaticExitHistory {
    records: Vec<ExitRecord>,
}

impl StaticExitHistory {
    pub fn new(records: Vec<ExitRecord>) -> Self {
        Self { records }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(json)
            .map_err(|err| VigilError::json("parsing exit history", err))?;
        Ok(Self::new(records_from_document(document)?))
    }
}

impl ExitHistorySource for StaticExitHistory {
    fn exit_records(&self) -> Result<Vec<ExitRecord>> {
        Ok(self.records.clone())
    }
}

fn records_from_document(document: Value) -> Result<Vec<ExitRecord>> {
    let (records, rejected) =
        parse_exit_history(document).map_err(|err| VigilError::HistoryRejected(err.to_string()))?;
    if rejected > 0 {
        warn!(rejected, "Dropped invalid exit records");
    }
    Ok(records)
}

/// Reads the diagnostic stream of an exit record as text.
pub fn open_diagnostic(diagnostic: &DiagnosticRef) -> Result<String> {
    match diagnostic {
        DiagnosticRef::Inline(text) => Ok(text.clone()),
        DiagnosticRef::Path(path) => {
            let bytes = fs::read(path)
                .map_err(|err| VigilError::io(format!("reading {}", path.display()), err))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}
