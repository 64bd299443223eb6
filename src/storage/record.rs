//! Per-property revision records and the lazy document handle.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{StorageError, StorageResult};

/// File holding the PropertyMeta of an aggregated property, inside its directory.
pub(crate) const AGGREGATE_META: &str = ".meta";

/// Marker distinguishing a document directory from a stray one.
pub(crate) const DOCUMENT_MARKER: &str = ".document";

pub(crate) const BLOB_SUFFIX: &str = ".blob";

/// Revision record kept on disk for every property of every document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyMeta {
    pub value: serde_json::Value,

    /// Wall-clock seconds of the most recent write to this property.
    pub mtime: i64,

    /// Volume seqno assigned at that write.
    pub seqno: u64,
}

impl PropertyMeta {
    pub fn new(value: serde_json::Value, mtime: i64, seqno: u64) -> Self {
        Self { value, mtime, seqno }
    }
}

/// Handle to one document directory. Property files are read on demand.
#[derive(Clone, Debug)]
pub struct Record {
    guid: String,
    path: PathBuf,
}

impl Record {
    pub(crate) fn new(guid: impl Into<String>, path: PathBuf) -> Self {
        Self {
            guid: guid.into(),
            path,
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the PropertyMeta of `prop`, or `None` if it was never written.
    pub fn meta(&self, prop: &str) -> StorageResult<Option<PropertyMeta>> {
        let path = self.path.join(prop);
        let file = if path.is_dir() {
            path.join(AGGREGATE_META)
        } else {
            path
        };
        read_meta(&file)
    }

    /// Reads every property written so far.
    pub fn all(&self) -> StorageResult<BTreeMap<String, PropertyMeta>> {
        let mut props = BTreeMap::new();
        for name in self.property_names()? {
            if let Some(meta) = self.meta(&name)? {
                props.insert(name, meta);
            }
        }
        Ok(props)
    }

    /// Names of the property files present in the document directory.
    pub fn property_names(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(BLOB_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Largest seqno over all properties.
    pub fn seqno(&self) -> StorageResult<u64> {
        Ok(self.all()?.values().map(|m| m.seqno).max().unwrap_or(0))
    }

    /// Largest mtime over all properties.
    pub fn mtime(&self) -> StorageResult<i64> {
        Ok(self.all()?.values().map(|m| m.mtime).max().unwrap_or(0))
    }
}

pub(crate) fn read_meta(path: &Path) -> StorageResult<Option<PropertyMeta>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
