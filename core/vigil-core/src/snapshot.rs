//! Persisted scope and options snapshots.
//!
//! While the process is alive, an observer mirrors every scope/options
//! mutation into one small JSON file per facet. After a restart those files
//! are the only record of what the failed process knew, and the enricher
//! reads them to backfill deferred events.
//!
//! ```text
//! scope-cache/                     options-cache/
//! ├── breadcrumbs.json             ├── release.json
//! ├── user.json                    ├── environment.json
//! ├── tags.json                    ├── dist.json
//! ├── extras.json                  ├── symbol-map-id.json
//! ├── contexts.json                ├── sdk-version.json
//! ├── request.json                 └── tags.json
//! ├── level.json
//! ├── fingerprint.json
//! ├── transaction.json
//! └── trace.json
//! ```
//!
//! The reader never fails: an absent file is "not captured" and a corrupt
//! file is logged and treated the same way.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use vigil_protocol::{Breadcrumb, Contexts, Level, Request, Sdk, TraceContext, User};

use crate::error::{Result, VigilError};
use crate::files::{read_optional, remove_if_exists, write_atomically};
use crate::storage::StorageConfig;

pub const MAX_PERSISTED_BREADCRUMBS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFacet {
    Breadcrumbs,
    User,
    Tags,
    Extras,
    Contexts,
    Request,
    Level,
    Fingerprint,
    Transaction,
    Trace,
}

impl ScopeFacet {
    pub fn file_name(self) -> &'static str {
        match self {
            ScopeFacet::Breadcrumbs => "breadcrumbs.json",
            ScopeFacet::User => "user.json",
            ScopeFacet::Tags => "tags.json",
            ScopeFacet::Extras => "extras.json",
            ScopeFacet::Contexts => "contexts.json",
            ScopeFacet::Request => "request.json",
            ScopeFacet::Level => "level.json",
            ScopeFacet::Fingerprint => "fingerprint.json",
            ScopeFacet::Transaction => "transaction.json",
            ScopeFacet::Trace => "trace.json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsFacet {
    Release,
    Environment,
    Dist,
    SymbolMapId,
    Sdk,
    Tags,
}

impl OptionsFacet {
    pub fn file_name(self) -> &'static str {
        match self {
            OptionsFacet::Release => "release.json",
            OptionsFacet::Environment => "environment.json",
            OptionsFacet::Dist => "dist.json",
            OptionsFacet::SymbolMapId => "symbol-map-id.json",
            OptionsFacet::Sdk => "sdk-version.json",
            OptionsFacet::Tags => "tags.json",
        }
    }
}

fn scope_path(storage: &StorageConfig, facet: ScopeFacet) -> PathBuf {
    storage.scope_cache_dir().join(facet.file_name())
}

fn options_path(storage: &StorageConfig, facet: OptionsFacet) -> PathBuf {
    storage.options_cache_dir().join(facet.file_name())
}

/// Read side, used once after restart.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    storage: StorageConfig,
}

impl SnapshotReader {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn scope<T: DeserializeOwned>(&self, facet: ScopeFacet) -> Option<T> {
        read_facet(&scope_path(&self.storage, facet))
    }

    pub fn options<T: DeserializeOwned>(&self, facet: OptionsFacet) -> Option<T> {
        read_facet(&options_path(&self.storage, facet))
    }

    pub fn breadcrumbs(&self) -> Option<Vec<Breadcrumb>> {
        self.scope(ScopeFacet::Breadcrumbs)
    }

    pub fn user(&self) -> Option<User> {
        self.scope(ScopeFacet::User)
    }

    pub fn tags(&self) -> Option<BTreeMap<String, String>> {
        self.scope(ScopeFacet::Tags)
    }

    pub fn extras(&self) -> Option<BTreeMap<String, Value>> {
        self.scope(ScopeFacet::Extras)
    }

    pub fn contexts(&self) -> Option<Contexts> {
        self.scope(ScopeFacet::Contexts)
    }

    pub fn request(&self) -> Option<Request> {
        self.scope(ScopeFacet::Request)
    }

    pub fn level(&self) -> Option<Level> {
        self.scope(ScopeFacet::Level)
    }

    pub fn fingerprint(&self) -> Option<Vec<String>> {
        self.scope(ScopeFacet::Fingerprint)
    }

    pub fn transaction(&self) -> Option<String> {
        self.scope(ScopeFacet::Transaction)
    }

    pub fn trace(&self) -> Option<TraceContext> {
        self.scope(ScopeFacet::Trace)
    }

    pub fn release(&self) -> Option<String> {
        self.options(OptionsFacet::Release)
    }

    pub fn environment(&self) -> Option<String> {
        self.options(OptionsFacet::Environment)
    }

    pub fn dist(&self) -> Option<String> {
        self.options(OptionsFacet::Dist)
    }

    pub fn symbol_map_id(&self) -> Option<String> {
        self.options(OptionsFacet::SymbolMapId)
    }

    pub fn sdk(&self) -> Option<Sdk> {
        self.options(OptionsFacet::Sdk)
    }

    pub fn options_tags(&self) -> Option<BTreeMap<String, String>> {
        self.options(OptionsFacet::Tags)
    }
}

fn read_facet<T: DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let bytes = match read_optional(path) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(err) => {
            warn!(error = %err, "Failed to read snapshot facet");
            return None;
        }
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "Ignoring corrupt snapshot facet"
            );
            None
        }
    }
}

/// Write side, used by the scope/options observer while the process is alive.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    storage: StorageConfig,
}

impl SnapshotWriter {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn write_scope<T: Serialize + ?Sized>(&self, facet: ScopeFacet, value: &T) -> Result<()> {
        write_facet(&scope_path(&self.storage, facet), value)
    }

    pub fn write_options<T: Serialize + ?Sized>(
        &self,
        facet: OptionsFacet,
        value: &T,
    ) -> Result<()> {
        write_facet(&options_path(&self.storage, facet), value)
    }

    pub fn clear_scope(&self, facet: ScopeFacet) -> Result<()> {
        remove_if_exists(&scope_path(&self.storage, facet))
    }

    pub fn clear_options(&self, facet: OptionsFacet) -> Result<()> {
        remove_if_exists(&options_path(&self.storage, facet))
    }

    /// Appends a breadcrumb, keeping only the newest `MAX_PERSISTED_BREADCRUMBS`.
    pub fn append_breadcrumb(&self, breadcrumb: Breadcrumb) -> Result<()> {
        let reader = SnapshotReader::new(self.storage.clone());
        let mut breadcrumbs = reader.breadcrumbs().unwrap_or_default();
        breadcrumbs.push(breadcrumb);
        if breadcrumbs.len() > MAX_PERSISTED_BREADCRUMBS {
            let overflow = breadcrumbs.len() - MAX_PERSISTED_BREADCRUMBS;
            breadcrumbs.drain(..overflow);
        }
        self.write_scope(ScopeFacet::Breadcrumbs, &breadcrumbs)
    }
}

fn write_facet<T: Serialize + ?Sized>(path: &std::path::Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|err| VigilError::json(format!("serializing {}", path.display()), err))?;
    write_atomically(path, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_err as fs;
    use tempfile::tempdir;

    fn storage() -> (tempfile::TempDir, StorageConfig) {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        (temp, storage)
    }

    #[test]
    fn writer_and_reader_share_facet_files() {
        let (_temp, storage) = storage();
        let writer = SnapshotWriter::new(storage.clone());
        let reader = SnapshotReader::new(storage);

        writer
            .write_scope(
                ScopeFacet::User,
                &User {
                    id: Some("u-1".to_string()),
                    ..User::default()
                },
            )
            .unwrap();
        writer
            .write_options(OptionsFacet::Release, "com.example@1.0+1")
            .unwrap();

        assert_eq!(reader.user().unwrap().id.as_deref(), Some("u-1"));
        assert_eq!(reader.release().as_deref(), Some("com.example@1.0+1"));
        assert!(reader.environment().is_none());
    }

    #[test]
    fn scope_and_options_tags_do_not_collide() {
        let (_temp, storage) = storage();
        let writer = SnapshotWriter::new(storage.clone());
        let reader = SnapshotReader::new(storage);

        let mut scope_tags = BTreeMap::new();
        scope_tags.insert("screen".to_string(), "home".to_string());
        writer.write_scope(ScopeFacet::Tags, &scope_tags).unwrap();

        assert_eq!(reader.tags().unwrap()["screen"], "home");
        assert!(reader.options_tags().is_none());
    }

    #[test]
    fn corrupt_or_empty_facets_read_as_absent() {
        let (_temp, storage) = storage();
        let dir = storage.scope_cache_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("level.json"), "{broken").unwrap();
        fs::write(dir.join("transaction.json"), "  \n").unwrap();

        let reader = SnapshotReader::new(storage);
        assert!(reader.level().is_none());
        assert!(reader.transaction().is_none());
    }

    #[test]
    fn append_breadcrumb_keeps_newest_entries() {
        let (_temp, storage) = storage();
        let writer = SnapshotWriter::new(storage.clone());
        for index in 0..(MAX_PERSISTED_BREADCRUMBS + 5) {
            writer
                .append_breadcrumb(Breadcrumb {
                    message: Some(format!("crumb-{}", index)),
                    ..Breadcrumb::default()
                })
                .unwrap();
        }

        let breadcrumbs = SnapshotReader::new(storage).breadcrumbs().unwrap();
        assert_eq!(breadcrumbs.len(), MAX_PERSISTED_BREADCRUMBS);
        assert_eq!(breadcrumbs[0].message.as_deref(), Some("crumb-5"));
    }

    #[test]
    fn clear_removes_facet() {
        let (_temp, storage) = storage();
        let writer = SnapshotWriter::new(storage.clone());
        writer.write_scope(ScopeFacet::Level, &Level::Warning).unwrap();
        writer.clear_scope(ScopeFacet::Level).unwrap();
        assert!(SnapshotReader::new(storage).level().is_none());
    }
}
