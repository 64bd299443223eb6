//! A volume: the set of directories rooted at one path.
//!
//! All directories of a volume share one [`Seqno`] counter and one [`EventHub`]. The
//! volume also owns the layout check: an older on-disk layout is migrated before any
//! index is opened, and the stale indexes are dropped so they get rebuilt.

pub mod events;

pub use events::{Event, EventFilter, EventHub, EventKind, Subscription};

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::directory::{Directory, INDEX_DIR};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::storage::{migrate, read_layout, write_layout, Storage, StorageError, LAYOUT_VERSION};

const SEQNO_FILE: &str = "seqno";

/// Volume-wide write counter, persisted in `<root>/seqno`.
#[derive(Debug)]
pub struct Seqno {
    path: PathBuf,

    /// Last assigned value
    value: AtomicU64,

    /// Last value written to disk
    persisted: Mutex<u64>,
}

impl Seqno {
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(content) => content.trim().parse::<u64>().map_err(|_| {
                Error::Storage(StorageError::Corrupted(format!(
                    "{}: {:?}",
                    path.display(),
                    content.trim()
                )))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        debug!(seqno = value, "Loaded seqno");
        Ok(Arc::new(Self {
            path,
            value: AtomicU64::new(value),
            persisted: Mutex::new(value),
        }))
    }

    /// Assigns the next seqno.
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Moves the counter forward to at least `seen`.
    pub fn observe(&self, seen: u64) {
        self.value.fetch_max(seen, Ordering::SeqCst);
    }

    /// Writes the counter durably.
    pub fn commit(&self) -> Result<()> {
        let mut persisted = self.persisted.lock();
        let value = self.current();
        if value == *persisted {
            return Ok(());
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
        tmp.write_all(value.to_string().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        *persisted = value;
        debug!(seqno = value, "Committed seqno");
        Ok(())
    }
}

/// Set of directories sharing a seqno and an event bus.
pub struct Volume {
    root: PathBuf,
    config: Arc<Config>,
    seqno: Arc<Seqno>,
    events: Arc<EventHub>,
    directories: BTreeMap<String, Arc<Directory>>,
}

impl Volume {
    /// Opens the volume, migrating the on-disk layout first when it is older.
    pub fn open(config: Config, resources: Vec<Metadata>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let root = config.data_root.clone();
        fs::create_dir_all(&root)?;

        check_layout(&root, &config, &resources)?;

        let seqno = Seqno::open(root.join(SEQNO_FILE))?;
        let events = EventHub::new(config.event_buffer);

        let mut directories = BTreeMap::new();
        for metadata in resources {
            let name = metadata.name().to_string();
            let directory =
                Directory::open(&root, metadata, seqno.clone(), events.clone(), config.clone())?;
            seqno.observe(directory.max_seqno()?);
            directories.insert(name, Arc::new(directory));
        }

        info!(
            root = %root.display(),
            resources = directories.len(),
            seqno = seqno.current(),
            "Opened volume"
        );

        Ok(Self {
            root,
            config,
            seqno,
            events,
            directories,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn directory(&self, resource: &str) -> Result<&Arc<Directory>> {
        self.directories
            .get(resource)
            .ok_or_else(|| Error::NotFound(format!("resource {}", resource)))
    }

    pub fn directories(&self) -> impl Iterator<Item = &Arc<Directory>> {
        self.directories.values()
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.directories.keys().map(String::as_str)
    }

    pub fn seqno(&self) -> u64 {
        self.seqno.current()
    }

    pub fn next_seqno(&self) -> u64 {
        self.seqno.next()
    }

    /// Persists the seqno counter.
    pub fn commit(&self) -> Result<()> {
        self.seqno.commit()
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.events.subscribe(filter)
    }

    /// Re-indexes documents written after the last index commit of each directory.
    pub async fn populate(&self) -> Result<usize> {
        let mut total = 0;
        for directory in self.directories.values() {
            total += directory.populate()?.run().await?;
        }
        Ok(total)
    }

    /// Commits every directory.
    pub async fn flush(&self) -> Result<()> {
        for directory in self.directories.values() {
            directory.commit().await?;
        }
        self.seqno.commit()
    }

    /// Drains and stops every writer, then persists the seqno.
    pub async fn close(&self) -> Result<()> {
        for directory in self.directories.values() {
            directory.close().await?;
        }
        self.seqno.commit()?;
        info!(root = %self.root.display(), seqno = self.seqno.current(), "Closed volume");
        Ok(())
    }
}

/// Brings the on-disk layout to [`LAYOUT_VERSION`].
///
/// Returns whether a migration ran.
fn check_layout(root: &Path, config: &Config, resources: &[Metadata]) -> Result<bool> {
    let expected = LAYOUT_VERSION;
    let found = match read_layout(root)? {
        Some(version) => version,
        None => {
            let mut populated = false;
            for metadata in resources {
                let path = root.join(metadata.name());
                if path.is_dir() {
                    let storage = Storage::open(path, config.blob_chunk_size)?;
                    populated |= !storage.walk(std::time::UNIX_EPOCH)?.is_empty();
                }
            }
            if !populated {
                write_layout(root, expected)?;
                return Ok(false);
            }
            0
        }
    };

    if found == expected {
        return Ok(false);
    }
    if found > expected {
        error!(found, expected, "Layout is newer than this build");
        return Err(Error::LayoutMismatch { found, expected });
    }

    for metadata in resources {
        let storage = Storage::open(root.join(metadata.name()), config.blob_chunk_size)?;
        let count = migrate(&storage, metadata, found, &config.default_language).map_err(|e| {
            error!(resource = %metadata.name(), "Layout migration failed: {}", e);
            Error::LayoutMismatch { found, expected }
        })?;

        let index = storage.root().join(INDEX_DIR);
        if index.exists() {
            fs::remove_dir_all(&index)?;
        }
        info!(resource = %metadata.name(), documents = count, "Migrated resource");
    }

    write_layout(root, expected)?;
    info!(from = found, to = expected, "Storage layout migrated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{PropertyDescriptor, Typecast};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resources() -> Vec<Metadata> {
        vec![Metadata::new(
            "context",
            vec![PropertyDescriptor::new("title", Typecast::Str)
                .slot(10)
                .prefix("T")
                .full_text()
                .localized()],
        )
        .unwrap()]
    }

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path()).with_flush(100, Duration::ZERO)
    }

    #[test]
    fn test_seqno_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("seqno");
        let seqno = Seqno::open(&path).unwrap();
        assert_eq!(seqno.next(), 1);
        assert_eq!(seqno.next(), 2);
        seqno.commit().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2");

        let reopened = Seqno::open(&path).unwrap();
        assert_eq!(reopened.current(), 2);
        reopened.observe(10);
        reopened.observe(5);
        assert_eq!(reopened.next(), 11);
    }

    #[test]
    fn test_corrupted_seqno() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("seqno");
        fs::write(&path, "not a number").unwrap();
        assert!(Seqno::open(&path).is_err());
    }

    #[tokio::test]
    async fn test_open_writes_layout() {
        let temp_dir = TempDir::new().unwrap();
        let volume = Volume::open(config(&temp_dir), resources()).unwrap();
        assert_eq!(read_layout(temp_dir.path()).unwrap(), Some(LAYOUT_VERSION));
        assert!(volume.directory("context").is_ok());
        assert!(matches!(volume.directory("nope"), Err(Error::NotFound(_))));
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_layout_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        write_layout(temp_dir.path(), LAYOUT_VERSION + 1).unwrap();
        let result = Volume::open(config(&temp_dir), resources());
        assert!(matches!(result, Err(Error::LayoutMismatch { .. })));
    }

    #[tokio::test]
    async fn test_seqno_shared_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let volume = Volume::open(config(&temp_dir), resources()).unwrap();
            let directory = volume.directory("context").unwrap();
            let props = json!({"title": "one"}).as_object().cloned().unwrap();
            directory.create(props).await.unwrap();
            volume.close().await.unwrap();
            assert_eq!(volume.seqno(), 1);
        }

        let volume = Volume::open(config(&temp_dir), resources()).unwrap();
        assert_eq!(volume.seqno(), 1);
        assert_eq!(volume.next_seqno(), 2);
        volume.close().await.unwrap();
    }
}
