//! Runtime configuration (`vigil.toml`).
//!
//! Every section and field is optional; a missing file means defaults.
//!
//! ```toml
//! [watchdog]
//! interval_ms = 5000
//! report_in_debug = false
//!
//! [reconcile]
//! report_historical_hangs = true
//! flush_timeout_ms = 15000
//! await_previous_session = false
//!
//! [native]
//! correlation_tolerance_ms = 5000
//!
//! [app]
//! name = "Example"
//! package = "com.example"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_RETENTION_DAYS: i64 = 91;
pub const DEFAULT_CORRELATION_TOLERANCE_MS: i64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct VigilConfig {
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub native: NativeSettings,
    #[serde(default)]
    pub app: AppSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watchdog_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub report_in_debug: bool,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            report_in_debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileSettings {
    #[serde(default)]
    pub report_historical_hangs: bool,
    #[serde(default)]
    pub report_historical_native_faults: bool,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_flush_timeout_ms")]
    pub session_flush_timeout_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Hold reconciliation until the host marks the previous session flushed
    /// (bounded by `session_flush_timeout_ms`).
    #[serde(default)]
    pub await_previous_session: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            report_historical_hangs: false,
            report_historical_native_faults: false,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            session_flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            retention_days: DEFAULT_RETENTION_DAYS,
            await_previous_session: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NativeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_correlation_tolerance_ms")]
    pub correlation_tolerance_ms: i64,
}

impl Default for NativeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            correlation_tolerance_ms: DEFAULT_CORRELATION_TOLERANCE_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_MS
}

fn default_flush_timeout_ms() -> u64 {
    DEFAULT_FLUSH_TIMEOUT_MS
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

fn default_correlation_tolerance_ms() -> i64 {
    DEFAULT_CORRELATION_TOLERANCE_MS
}

/// Loads `vigil.toml`, returning defaults if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<VigilConfig> {
    if !path.exists() {
        return Ok(VigilConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| VigilError::io(format!("reading {}", path.display()), err))?;
    toml::from_str::<VigilConfig>(&content).map_err(|err| VigilError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
