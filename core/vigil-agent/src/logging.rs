//! Logging setup: stderr plus a daily-rolling file under `<root>/logs`.
//!
//! `VIGIL_DEBUG_LOG=1` forces debug level; otherwise `RUST_LOG` applies,
//! defaulting to info. The returned guard flushes the file writer on drop and
//! must be held for the life of the process.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "vigil.log";

fn debug_enabled() -> bool {
    env::var("VIGIL_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Falls back to stderr only when the log
/// directory can't be created.
pub fn init(logs_dir: &Path) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if let Err(err) = fs_err::create_dir_all(logs_dir) {
        tracing_subscriber::registry()
            .with(filter())
            .with(stderr_layer)
            .init();
        tracing::warn!(error = %err, "File logging disabled");
        return None;
    }

    let appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}
