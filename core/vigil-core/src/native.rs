//! Correlation of native fault exit records with outbox events.
//!
//! A native fault can be seen twice: once by the in-process signal handler,
//! which writes an event into the outbox before the process dies, and once
//! by the OS, which keeps an exit record with a tombstone. The correlator
//! finds the outbox event for an exit record so the two are reported as one.
//!
//! The outbox is scanned once, on first use. For each file only the event
//! header fields (`platform`, `timestamp`) are parsed; payloads are skipped
//! via the envelope's bounded sub-reader. Matching removes the candidate, so
//! each outbox event is claimed by at most one exit record.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::DateTime;
use fs_err as fs;
use serde::Deserialize;
use tracing::{debug, info, warn};
use vigil_protocol::EnrichedEvent;
use walkdir::WalkDir;

use crate::envelope::{read_event_envelope, EnvelopeReader, EVENT_ITEM_TYPE};
use crate::files::remove_if_exists;

pub const NATIVE_PLATFORM: &str = "native";

/// Lightweight metadata retained per native outbox event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedEvent {
    pub path: PathBuf,
    pub event: EnrichedEvent,
}

/// Header fields needed to classify an outbox event. Everything else in the
/// payload is skipped by the deserializer without being materialized.
#[derive(Debug, Deserialize)]
struct EventHeader {
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    timestamp: Option<RawTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(f64),
    Text(String),
}

impl RawTimestamp {
    fn to_millis(&self) -> Option<i64> {
        match self {
            RawTimestamp::Seconds(seconds) => Some((seconds * 1000.0).round() as i64),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.timestamp_millis())
                .or_else(|| text.parse::<f64>().ok().map(|s| (s * 1000.0).round() as i64)),
        }
    }
}

pub struct NativeEventCorrelator {
    outbox: PathBuf,
    tolerance_ms: i64,
    // None until the first lookup scans the outbox.
    candidates: Mutex<Option<Vec<Candidate>>>,
}

impl NativeEventCorrelator {
    pub fn new(outbox: impl Into<PathBuf>, tolerance_ms: i64) -> Self {
        Self {
            outbox: outbox.into(),
            tolerance_ms,
            candidates: Mutex::new(None),
        }
    }

    /// Number of unclaimed native candidates (scans the outbox if needed).
    pub fn candidate_count(&self) -> usize {
        let mut guard = self
            .candidates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get_or_insert_with(|| scan_outbox(&self.outbox)).len()
    }

    /// Claims the candidate closest to `timestamp` within the tolerance and
    /// fully loads it.
    ///
    /// A claimed candidate whose payload cannot be loaded is logged and not
    /// offered again.
    pub fn find_match(&self, timestamp: i64) -> Option<CorrelatedEvent> {
        let candidate = {
            let mut guard = self
                .candidates
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let candidates = guard.get_or_insert_with(|| scan_outbox(&self.outbox));

            let index = candidates
                .iter()
                .enumerate()
                .map(|(index, candidate)| (index, (candidate.timestamp - timestamp).abs()))
                .filter(|(_, distance)| *distance <= self.tolerance_ms)
                .min_by_key(|(_, distance)| *distance)
                .map(|(index, _)| index)?;
            candidates.remove(index)
        };

        debug!(
            path = %candidate.path.display(),
            candidate_ts = candidate.timestamp,
            record_ts = timestamp,
            "Matched native outbox event"
        );

        match read_event_envelope(&candidate.path) {
            Ok(event) => Some(CorrelatedEvent {
                path: candidate.path,
                event,
            }),
            Err(err) => {
                warn!(
                    error = %err,
                    path = %candidate.path.display(),
                    "Failed to load matched native event"
                );
                None
            }
        }
    }
}

/// Removes an outbox file made redundant by a merged report. Failure is
/// logged only; the transport may still pick the file up.
pub fn discard_outbox_file(path: &Path) {
    match remove_if_exists(path) {
        Ok(()) => info!(path = %path.display(), "Removed correlated native event"),
        Err(err) => warn!(
            error = %err,
            path = %path.display(),
            "Failed to remove correlated native event"
        ),
    }
}

fn scan_outbox(outbox: &Path) -> Vec<Candidate> {
    if !outbox.is_dir() {
        debug!(outbox = %outbox.display(), "Outbox does not exist, no native candidates");
        return Vec::new();
    }

    let mut candidates: Vec<Candidate> = WalkDir::new(outbox)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| classify(entry.path()))
        .collect();
    candidates.sort_by_key(|candidate| candidate.timestamp);

    debug!(count = candidates.len(), "Scanned outbox for native events");
    candidates
}

fn classify(path: &Path) -> Option<Candidate> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(error = %err, "Failed to open outbox file");
            return None;
        }
    };

    let mut reader = match EnvelopeReader::new(BufReader::new(file)) {
        Ok(reader) => reader,
        Err(err) => {
            debug!(error = %err, path = %path.display(), "Skipping non-envelope outbox file");
            return None;
        }
    };

    loop {
        let mut item = match reader.next_item() {
            Ok(Some(item)) => item,
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, path = %path.display(), "Stopped reading outbox file");
                return None;
            }
        };
        if item.header.ty != EVENT_ITEM_TYPE {
            continue;
        }

        let header: EventHeader = match item.read_json() {
            Ok(header) => header,
            Err(err) => {
                debug!(error = %err, path = %path.display(), "Unreadable event header");
                return None;
            }
        };
        if header.platform.as_deref() != Some(NATIVE_PLATFORM) {
            return None;
        }
        let timestamp = header.timestamp.as_ref().and_then(RawTimestamp::to_millis)?;
        return Some(Candidate {
            path: path.to_path_buf(),
            timestamp,
        });
    }
}
