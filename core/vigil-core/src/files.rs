//! Small durable-file helpers shared by markers, snapshots and the envelope cache.
//!
//! Writes go through temp file + rename in the destination directory so a
//! reader never observes a partially written file, even if the process dies
//! mid-write.

use std::io::Write;
use std::path::Path;

use fs_err as fs;
use tempfile::NamedTempFile;

use crate::error::{Result, VigilError};

/// Atomically replaces `path` with `bytes`, creating the parent directory.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent_dir = path
        .parent()
        .ok_or_else(|| VigilError::FileNotFound(path.to_path_buf()))?;
    fs::create_dir_all(parent_dir)
        .map_err(|err| VigilError::io(format!("creating {}", parent_dir.display()), err))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|err| VigilError::io("creating temp file", err))?;
    temp_file
        .write_all(bytes)
        .map_err(|err| VigilError::io(format!("writing temp file for {}", path.display()), err))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|err| VigilError::io(format!("syncing temp file for {}", path.display()), err))?;
    temp_file
        .persist(path)
        .map_err(|err| VigilError::io(format!("committing {}", path.display()), err.error))?;
    Ok(())
}

/// Reads a file, mapping "does not exist" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(VigilError::io(format!("reading {}", path.display()), err)),
    }
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(VigilError::io(format!("removing {}", path.display()), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomically_creates_parent_and_replaces_content() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("value");

        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn read_optional_maps_missing_to_none() {
        let temp = tempdir().unwrap();
        assert!(read_optional(&temp.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("file");
        fs::write(&path, "x").unwrap();
        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
