//! # vigil-core
//!
//! Crash and hang telemetry pipeline for mobile hosts: live hang detection,
//! startup reconciliation of the OS exit history, deferred enrichment of
//! events about a dead process, and de-duplication of native faults seen by
//! both the signal handler and the OS.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The watchdog owns one thread and
//!   reconciliation runs on a `vigil-reconcile` worker thread.
//! - **Degrade, don't fail**: A corrupt snapshot, marker or trace is logged
//!   and treated as absent. Nothing here ever takes the host process down.
//! - **At-least-once**: Markers move only after a report is durably written,
//!   so a crash mid-report means a duplicate, never a loss.
//! - **FFI-ready**: UniFFI annotations on [`VigilEngine`] and its records.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vigil_core::VigilEngine;
//!
//! let engine = Arc::new(VigilEngine::new(None)?);
//! let task = engine.clone().run_startup_reconciliation(history_json)?;
//! let reports = task.wait(30_000)?;
//! ```

// UniFFI scaffolding for Swift/Kotlin bindings
uniffi::setup_scaffolding!();

pub mod config;
pub mod device;
pub mod engine;
pub mod enrich;
pub mod envelope;
pub mod error;
pub mod files;
pub mod installation;
pub mod markers;
pub mod native;
pub mod parse;
pub mod patterns;
pub mod reconcile;
pub mod sink;
pub mod snapshot;
pub mod storage;
pub mod watchdog;

pub use config::{load_config, VigilConfig};
pub use device::{DeviceInfoProvider, StaticDeviceInfo, SystemDeviceInfo};
pub use engine::{CategoryReport, MarkerValue, ReconcileTask, VigilEngine};
pub use enrich::DeferredEventEnricher;
pub use error::{Result, VigilError, VigilFfiError};
pub use markers::MarkerStore;
pub use native::NativeEventCorrelator;
pub use reconcile::{
    EmittedReport, ExitHistoryReconciler, ExitHistorySource, JsonExitHistory, ReconcileOutcome,
    StaticExitHistory,
};
pub use sink::{EnvelopeSink, ReportHint, ReportSink};
pub use snapshot::{OptionsFacet, ScopeFacet, SnapshotReader, SnapshotWriter};
pub use storage::StorageConfig;
pub use watchdog::{HangWatchdog, MainContext, MainLoop, MainLoopHandle, WatchdogConfig};
