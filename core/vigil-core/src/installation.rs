//! Stable per-install identifier.
//!
//! Generated once as a ULID and persisted; deferred events with no user id
//! fall back to it so reports from one install group together.

use std::path::Path;

use tracing::warn;
use ulid::Ulid;

use crate::error::Result;
use crate::files::{read_optional, write_atomically};

/// Reads the installation id, creating and persisting one if absent.
pub fn installation_id(path: &Path) -> Result<String> {
    if let Some(bytes) = read_optional(path)? {
        let existing = String::from_utf8_lossy(&bytes).trim().to_string();
        if !existing.is_empty() {
            return Ok(existing);
        }
        warn!(path = %path.display(), "Installation file empty, regenerating");
    }

    let id = Ulid::new().to_string().to_lowercase();
    write_atomically(path, id.as_bytes())?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn installation_id_is_stable_across_calls() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("installation");
        let first = installation_id(&path).unwrap();
        let second = installation_id(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 26);
    }

    #[test]
    fn empty_installation_file_is_regenerated() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("installation");
        fs_err::write(&path, "").unwrap();
        let id = installation_id(&path).unwrap();
        assert!(!id.is_empty());
    }
}
