//! Durable "last processed" markers, one per report category.
//!
//! Each marker is a single small file holding the epoch-millisecond
//! timestamp of the newest exit record whose report was durably flushed.
//! Markers only move forward: an attempt to write an older timestamp is a
//! no-op, so replays and out-of-order flushes cannot rewind deduplication.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};
use vigil_protocol::ReportCategory;

use crate::error::Result;
use crate::files::{read_optional, write_atomically};
use crate::storage::StorageConfig;

#[derive(Debug)]
pub struct MarkerStore {
    storage: StorageConfig,
    // Serializes read-compare-write so concurrent flushes keep the max.
    write_lock: Mutex<()>,
}

impl MarkerStore {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self, category: ReportCategory) -> PathBuf {
        self.storage.marker_file(category)
    }

    /// Returns the persisted marker, or `None` when nothing was ever reported.
    ///
    /// An unreadable or corrupt marker is logged and treated as absent.
    pub fn read(&self, category: ReportCategory) -> Option<i64> {
        let path = self.path(category);
        let bytes = match read_optional(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, category = category.label(), "Failed to read marker");
                return None;
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        match text.trim().parse::<i64>() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    error = %err,
                    category = category.label(),
                    path = %path.display(),
                    "Ignoring corrupt marker"
                );
                None
            }
        }
    }

    /// Moves the marker forward to `timestamp`. Returns whether it moved.
    pub fn advance(&self, category: ReportCategory, timestamp: i64) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(current) = self.read(category) {
            if timestamp <= current {
                debug!(
                    category = category.label(),
                    current,
                    timestamp,
                    "Marker already at or past timestamp"
                );
                return Ok(false);
            }
        }

        write_atomically(&self.path(category), timestamp.to_string().as_bytes())?;
        debug!(category = category.label(), timestamp, "Marker advanced");
        Ok(true)
    }
}
