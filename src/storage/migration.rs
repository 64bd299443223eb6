//! Layout versioning.
//!
//! The `layout` file at the volume root holds the on-disk format version. Older trees
//! are rewritten in place, one step at a time, before any index is opened:
//!
//! - 0 → 1: BLOB payloads move from `<prop>` to `<prop>.blob`, and `<prop>` receives
//!   the BLOB reference (digest, size, mime type)
//! - 1 → 2: the split `<prop>` value file and `<prop>.meta` sidecar merge into one
//!   PropertyMeta file
//! - 2 → 3: plain strings in localized properties become `{default_language: text}`
//!
//! Every step checks the shape of what it rewrites, so re-running a step is a no-op.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use super::fs::{touch, write_atomic};
use super::record::{AGGREGATE_META, BLOB_SUFFIX};
use super::{PropertyMeta, Record, Storage, StorageError, StorageResult};
use crate::metadata::{BlobRef, Metadata, PropertyKind};

/// Current on-disk layout version.
pub const LAYOUT_VERSION: u32 = 3;

const LAYOUT_FILE: &str = "layout";
const SIDECAR_SUFFIX: &str = ".meta";

/// Sidecar written next to a property value before layout 2.
#[derive(Deserialize)]
struct SplitMeta {
    mtime: i64,
    #[serde(default)]
    seqno: u64,
}

/// Reads the layout version, or `None` when the file is absent.
pub fn read_layout(volume_root: &Path) -> StorageResult<Option<u32>> {
    match fs::read_to_string(volume_root.join(LAYOUT_FILE)) {
        Ok(content) => content
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| StorageError::Corrupted(format!("layout: {:?}", content.trim()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn write_layout(volume_root: &Path, version: u32) -> StorageResult<()> {
    fs::create_dir_all(volume_root)?;
    write_atomic(volume_root, LAYOUT_FILE, version.to_string().as_bytes())
}

/// Migrates every document of one resource from layout `from` to [`LAYOUT_VERSION`].
///
/// Returns the number of documents visited.
pub fn migrate(
    storage: &Storage,
    metadata: &Metadata,
    from: u32,
    default_language: &str,
) -> StorageResult<usize> {
    if from >= LAYOUT_VERSION {
        return Ok(0);
    }

    info!(
        resource = %metadata.name(),
        from,
        to = LAYOUT_VERSION,
        "Migrating storage layout"
    );

    let records = storage.walk(std::time::UNIX_EPOCH)?;
    for record in &records {
        if from < 1 {
            move_blobs(record, metadata)?;
        }
        if from < 2 {
            merge_sidecars(record)?;
        }
        if from < 3 {
            localize_strings(record, metadata, default_language)?;
        }
        touch(record.path())?;
        debug!(guid = %record.guid(), "Migrated document");
    }

    Ok(records.len())
}

fn move_blobs(record: &Record, metadata: &Metadata) -> StorageResult<()> {
    for prop in metadata.iter_kind(PropertyKind::Blob) {
        let value_path = record.path().join(&prop.name);
        let blob_path = record.path().join(format!("{}{}", prop.name, BLOB_SUFFIX));
        if blob_path.exists() || !value_path.is_file() {
            continue;
        }

        let data = fs::read(&value_path)?;
        fs::rename(&value_path, &blob_path)?;

        let blob = BlobRef {
            digest: hex::encode(Sha1::digest(&data)),
            size: data.len() as u64,
            mime_type: prop
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            url: None,
        };
        write_atomic(record.path(), &prop.name, &serde_json::to_vec(&blob)?)?;
    }
    Ok(())
}

fn merge_sidecars(record: &Record) -> StorageResult<()> {
    let mut sidecars = Vec::new();
    for entry in fs::read_dir(record.path())? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if let Some(prop) = name.strip_suffix(SIDECAR_SUFFIX) {
            sidecars.push(prop.to_string());
        }
    }

    for prop in sidecars {
        let sidecar_path = record.path().join(format!("{}{}", prop, SIDECAR_SUFFIX));
        let split: SplitMeta = serde_json::from_slice(&fs::read(&sidecar_path)?)
            .map_err(|e| StorageError::Migration(format!("{}: {}", sidecar_path.display(), e)))?;

        let value_path = record.path().join(&prop);
        if value_path.is_dir() {
            let children = aggregate_children(&value_path)?;
            let meta = PropertyMeta::new(serde_json::json!(children), split.mtime, split.seqno);
            write_atomic(&value_path, AGGREGATE_META, &serde_json::to_vec(&meta)?)?;
        } else {
            let value = match fs::read(&value_path) {
                Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::Migration(format!("{}: {}", value_path.display(), e))
                })?,
                Err(e) if e.kind() == ErrorKind::NotFound => serde_json::Value::Null,
                Err(e) => return Err(e.into()),
            };
            let meta = PropertyMeta::new(value, split.mtime, split.seqno);
            write_atomic(record.path(), &prop, &serde_json::to_vec(&meta)?)?;
        }

        fs::remove_file(&sidecar_path)?;
    }
    Ok(())
}

fn aggregate_children(dir: &Path) -> StorageResult<Vec<String>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            children.push(name);
        }
    }
    children.sort();
    Ok(children)
}

fn localize_strings(record: &Record, metadata: &Metadata, default_language: &str) -> StorageResult<()> {
    for prop in metadata.iter_kind(PropertyKind::Localized) {
        let Some(mut meta) = record.meta(&prop.name)? else {
            continue;
        };
        let serde_json::Value::String(text) = &meta.value else {
            continue;
        };
        meta.value = serde_json::json!({ default_language: text });
        write_atomic(record.path(), &prop.name, &serde_json::to_vec(&meta)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{PropertyDescriptor, Typecast};
    use serde_json::json;
    use tempfile::TempDir;

    fn metadata() -> Metadata {
        Metadata::new(
            "context",
            vec![
                PropertyDescriptor::new("title", Typecast::Str).localized(),
                PropertyDescriptor::new("k", Typecast::Int),
                PropertyDescriptor::blob("icon", "image/png"),
            ],
        )
        .unwrap()
    }

    fn write_v0_document(storage: &Storage, guid: &str) {
        let path = storage.document_path(guid);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(".document"), b"").unwrap();
        fs::write(path.join("title"), b"\"hello\"").unwrap();
        fs::write(path.join("title.meta"), b"{\"mtime\": 5, \"seqno\": 1}").unwrap();
        fs::write(path.join("k"), b"7").unwrap();
        fs::write(path.join("k.meta"), b"{\"mtime\": 6, \"seqno\": 2}").unwrap();
        fs::write(path.join("icon"), b"png-bytes").unwrap();
        fs::write(path.join("icon.meta"), b"{\"mtime\": 7, \"seqno\": 3}").unwrap();
    }

    #[test]
    fn test_layout_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(read_layout(temp_dir.path()).unwrap(), None);
        write_layout(temp_dir.path(), 2).unwrap();
        assert_eq!(read_layout(temp_dir.path()).unwrap(), Some(2));
    }

    #[test]
    fn test_migrate_from_zero() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("context"), 4096).unwrap();
        write_v0_document(&storage, "abcdef");

        let count = migrate(&storage, &metadata(), 0, "en").unwrap();
        assert_eq!(count, 1);

        let record = storage.get("abcdef").unwrap();
        let title = record.meta("title").unwrap().unwrap();
        assert_eq!(title.value, json!({"en": "hello"}));
        assert_eq!((title.mtime, title.seqno), (5, 1));

        let k = record.meta("k").unwrap().unwrap();
        assert_eq!(k, PropertyMeta::new(json!(7), 6, 2));

        let icon = record.meta("icon").unwrap().unwrap();
        let blob: BlobRef = serde_json::from_value(icon.value).unwrap();
        assert_eq!(blob.size, 9);
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(storage.get_blob("abcdef", "icon").unwrap().unwrap(), b"png-bytes");

        assert!(!record.path().join("title.meta").exists());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("context"), 4096).unwrap();
        write_v0_document(&storage, "abcdef");

        migrate(&storage, &metadata(), 0, "en").unwrap();
        let first = storage.get("abcdef").unwrap().all().unwrap();
        migrate(&storage, &metadata(), 0, "en").unwrap();
        let second = storage.get("abcdef").unwrap().all().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_migrate_current_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("context"), 4096).unwrap();
        assert_eq!(migrate(&storage, &metadata(), LAYOUT_VERSION, "en").unwrap(), 0);
    }
}
