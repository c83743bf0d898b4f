//! Error types for vigil-core operations.
//! Keep VigilFfiError minimal and stable to avoid breaking FFI clients.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// FFI-Compatible Error (for Swift/Kotlin)
// ═══════════════════════════════════════════════════════════════════════════════

/// FFI-safe error type for use across language boundaries.
///
/// Carries only a message string so it stays compatible with UniFFI.
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum VigilFfiError {
    #[error("{message}")]
    General { message: String },
}

impl From<String> for VigilFfiError {
    fn from(message: String) -> Self {
        VigilFfiError::General { message }
    }
}

impl From<&str> for VigilFfiError {
    fn from(message: &str) -> Self {
        VigilFfiError::General {
            message: message.to_string(),
        }
    }
}

impl From<VigilError> for VigilFfiError {
    fn from(err: VigilError) -> Self {
        VigilFfiError::General {
            message: err.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal Error (for Rust-only use)
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur in vigil-core operations.
///
/// Pipeline components log these and degrade; helpers propagate them with `?`.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage root could not be determined")]
    StorageRootNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // History Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Exit history rejected: {0}")]
    HistoryRejected(String),

    #[error("Exit history source unavailable: {0}")]
    HistoryUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // Envelope Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Malformed envelope {path}: {details}")]
    EnvelopeMalformed { path: PathBuf, details: String },

    #[error("Envelope {0} has no event item")]
    EnvelopeWithoutEvent(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl VigilError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        VigilError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        VigilError::Json {
            context: context.into(),
            source,
        }
    }

    /// True when the error only means the file was never written.
    pub fn is_not_found(&self) -> bool {
        match self {
            VigilError::FileNotFound(_) => true,
            VigilError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Convenience type alias for Results using VigilError.
pub type Result<T> = std::result::Result<T, VigilError>;

// Conversion for string error compatibility
impl From<VigilError> for String {
    fn from(err: VigilError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection_covers_io_errors() {
        let err = VigilError::io(
            "reading marker",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.is_not_found());
        assert!(VigilError::FileNotFound(PathBuf::from("/x")).is_not_found());
        assert!(!VigilError::StorageRootNotFound.is_not_found());
    }

    #[test]
    fn ffi_error_keeps_message() {
        let err: VigilFfiError = VigilError::HistoryRejected("bad version".to_string()).into();
        assert_eq!(err.to_string(), "Exit history rejected: bad version");
    }
}
