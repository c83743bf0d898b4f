//! Storage configuration and path management for vigil.
//!
//! `StorageConfig` is the single place that decides where durable crash-pipeline
//! state lives. Production code uses `StorageConfig::default()`; tests inject a
//! temp directory with `StorageConfig::with_root()`.
//!
//! ```text
//! <root>/
//! ├── vigil.toml                  # runtime configuration
//! ├── installation                # stable per-install identifier
//! ├── last_hang_report            # dedup marker (epoch ms)
//! ├── last_native_fault_report    # dedup marker (epoch ms)
//! ├── outbox/                     # native signal-handler events
//! ├── envelopes/                  # reports produced here, awaiting transport
//! ├── scope-cache/                # one JSON file per scope facet
//! ├── options-cache/              # one JSON file per options facet
//! └── logs/
//! ```

use std::path::{Path, PathBuf};

use vigil_protocol::ReportCategory;

const ROOT_DIR_NAME: &str = "vigil";

/// Central configuration for all vigil storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all vigil data (default: <cache dir>/vigil)
    root: PathBuf,
    /// Outbox the native fault handler writes into and the transport drains.
    /// Lives under `root` unless overridden.
    outbox: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::with_root(base.join(ROOT_DIR_NAME))
    }
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    /// Used for testing with temp directories.
    pub fn with_root(root: PathBuf) -> Self {
        let outbox = root.join("outbox");
        Self { root, outbox }
    }

    /// Creates a StorageConfig whose outbox lives outside the root, for hosts
    /// where the transport owns a separate cache directory.
    pub fn with_outbox(root: PathBuf, outbox: PathBuf) -> Self {
        Self { root, outbox }
    }

    /// Returns the root directory for vigil data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Global Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to vigil.toml (runtime configuration).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("vigil.toml")
    }

    /// Path to the installation identifier file.
    pub fn installation_file(&self) -> PathBuf {
        self.root.join("installation")
    }

    /// Path to the dedup marker for a report category.
    pub fn marker_file(&self, category: ReportCategory) -> PathBuf {
        match category {
            ReportCategory::Hang => self.root.join("last_hang_report"),
            ReportCategory::NativeFault => self.root.join("last_native_fault_report"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to outbox/ (events written by the native fault handler).
    pub fn outbox_dir(&self) -> &Path {
        &self.outbox
    }

    /// Path to envelopes/ (reports written by the sink). Kept apart from the
    /// outbox so the native correlator never claims the pipeline's own output.
    pub fn envelope_cache_dir(&self) -> PathBuf {
        self.root.join("envelopes")
    }

    /// Path to scope-cache/ (persisted scope facets).
    pub fn scope_cache_dir(&self) -> PathBuf {
        self.root.join("scope-cache")
    }

    /// Path to options-cache/ (persisted options facets).
    pub fn options_cache_dir(&self) -> PathBuf {
        self.root.join("options-cache")
    }

    /// Path to logs/ (rolling agent logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
