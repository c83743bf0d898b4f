//! Parsers for the raw diagnostic streams attached to exit records.
//!
//! - [`thread_dump`] turns a thread-state dump (hangs) into threads.
//! - [`tombstone`] turns a native fault trace into an exception.
//!
//! Both are best-effort text parsers: unknown lines are ignored and a
//! partially understood dump still yields whatever could be recovered.

use regex::Captures;
use vigil_protocol::{DebugImage, StackFrame};

pub mod thread_dump;
pub mod tombstone;

pub use thread_dump::{parse_thread_dump, ThreadDump, ThreadDumpOutcome};
pub use tombstone::{parse_tombstone, SignalInfo, Tombstone};

const SYSTEM_LIBRARY_PREFIXES: &[&str] = &["/system/", "/apex/", "/vendor/", "/product/"];

/// Whether a native binary belongs to the OS image rather than the app.
pub fn is_system_library(path: &str) -> bool {
    SYSTEM_LIBRARY_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
        || path.starts_with('[')
}

/// Builds a native frame from a match of one of the `#NN pc ...` patterns.
pub(crate) fn native_frame_from(caps: &Captures<'_>) -> StackFrame {
    let path = caps.name("path").map(|m| m.as_str().to_string());
    let symbol = caps
        .name("symbol")
        .map(|m| m.as_str().trim().to_string())
        .filter(|symbol| !symbol.is_empty());

    StackFrame {
        function: symbol.clone(),
        symbol,
        symbol_offset: caps
            .name("offset")
            .and_then(|m| m.as_str().parse::<u64>().ok()),
        instruction_addr: caps.name("pc").map(|m| format!("0x{}", m.as_str())),
        in_app: path.as_deref().map(|path| !is_system_library(path)),
        package: path,
        native: true,
        ..StackFrame::default()
    }
}

/// Debug image for a native binary that printed a build id.
pub(crate) fn elf_image(code_file: &str, build_id: &str, image_addr: Option<String>) -> DebugImage {
    DebugImage {
        ty: "elf".to_string(),
        code_file: Some(code_file.to_string()),
        code_id: Some(build_id.to_lowercase()),
        image_addr,
        ..DebugImage::default()
    }
}
