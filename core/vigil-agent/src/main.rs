//! vigil: command-line driver for the crash and hang pipeline.
//!
//! Lets a host script (or a developer) run the pipeline against a storage
//! root without embedding the library.
//!
//! ## Subcommands
//!
//! - `reconcile`: reconcile a JSON exit history into the envelope cache
//! - `markers`: print the dedup markers
//! - `watch`: run a main loop under the hang watchdog

mod error;
mod logging;
mod reconcile;
mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use vigil_core::reconcile::NoPreviousSession;
use vigil_core::{StorageConfig, SystemDeviceInfo, VigilConfig, VigilEngine};

use crate::error::AgentError;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Crash and hang telemetry pipeline")]
#[command(version)]
struct Cli {
    /// Storage root (defaults to the user cache directory)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile an exit history document into the envelope cache
    Reconcile {
        /// Path to the exit history JSON ({"version":1,"records":[...]})
        #[arg(long, value_name = "PATH")]
        history: PathBuf,

        /// Reconcile as of this time (epoch ms) instead of now
        #[arg(long, value_name = "EPOCH_MS")]
        now_ms: Option<i64>,
    },

    /// Print the last reported exit timestamp per category
    Markers,

    /// Run a main loop under the hang watchdog
    Watch {
        /// Block the main loop for this long right after start
        #[arg(long, value_name = "MS")]
        stall_ms: Option<u64>,

        /// How long to keep the loop running
        #[arg(long, value_name = "MS", default_value_t = 10_000)]
        duration_ms: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    let storage = cli
        .root
        .map(StorageConfig::with_root)
        .unwrap_or_default();
    let _logging_guard = logging::init(&storage.logs_dir());

    let result = match cli.command {
        Commands::Reconcile { history, now_ms } => reconcile::run(storage, &history, now_ms),
        Commands::Markers => print_markers(storage),
        Commands::Watch {
            stall_ms,
            duration_ms,
        } => watch::run(
            storage,
            stall_ms.map(Duration::from_millis),
            Duration::from_millis(duration_ms),
        ),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "vigil failed");
        std::process::exit(1);
    }
}

/// Builds the engine for `storage`. A malformed `vigil.toml` is logged and
/// replaced by defaults.
pub(crate) fn open_engine(storage: StorageConfig) -> VigilEngine {
    match VigilEngine::with_storage(storage.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::warn!(error = %err, "Invalid configuration, using defaults");
            VigilEngine::with_parts(
                storage,
                VigilConfig::default(),
                Arc::new(SystemDeviceInfo),
                Arc::new(NoPreviousSession),
            )
        }
    }
}

fn print_markers(storage: StorageConfig) -> Result<(), AgentError> {
    let engine = open_engine(storage);
    let markers: Vec<_> = engine
        .markers()
        .into_iter()
        .map(|marker| json!({ "category": marker.category, "timestamp_ms": marker.timestamp_ms }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&json!({ "markers": markers }))?);
    Ok(())
}
