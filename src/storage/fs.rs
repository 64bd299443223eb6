//! Filesystem implementation of the document tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::record::{AGGREGATE_META, BLOB_SUFFIX, DOCUMENT_MARKER};
use super::{PropertyMeta, Record, StorageError, StorageResult};

#[cfg(unix)]
const STICKY: u32 = 0o1000;

/// Size and digest of a stored BLOB payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub digest: String,
}

/// One resource's document tree.
#[derive(Clone, Debug)]
pub struct Storage {
    /// Resource root directory.
    root: PathBuf,

    /// Chunk size for BLOB streaming.
    chunk_size: usize,
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>, chunk_size: usize) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!("Opened storage at {:?}", root);
        Ok(Self {
            root,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Directory of a document: `<root>/<guid[:2]>/<guid>`.
    pub fn document_path(&self, guid: &str) -> PathBuf {
        let shard = guid.get(..2).unwrap_or(guid);
        self.root.join(shard).join(guid)
    }

    pub fn exists(&self, guid: &str) -> bool {
        self.document_path(guid).join(DOCUMENT_MARKER).is_file()
    }

    /// Returns a handle to an existing document.
    pub fn get(&self, guid: &str) -> StorageResult<Record> {
        if !self.exists(guid) {
            return Err(StorageError::NotFound(guid.to_string()));
        }
        Ok(Record::new(guid, self.document_path(guid)))
    }

    /// Upserts property files. Each property is replaced atomically.
    pub fn put(&self, guid: &str, props: &BTreeMap<String, PropertyMeta>) -> StorageResult<()> {
        validate_name(guid)?;
        let path = self.ensure_document(guid)?;

        for (name, meta) in props {
            validate_name(name)?;
            let target = path.join(name);
            if target.is_dir() {
                write_atomic(&target, AGGREGATE_META, &serde_json::to_vec(meta)?)?;
            } else {
                write_atomic(&path, name, &serde_json::to_vec(meta)?)?;
            }
        }

        touch(&path)?;
        debug!(guid = %guid, props = props.len(), "Stored properties");
        Ok(())
    }

    /// Writes an aggregated property: its PropertyMeta and one flag file per child.
    ///
    /// Children listed in the value are flagged active; children recorded earlier but
    /// missing from the value stay on disk with the flag cleared.
    pub fn put_aggregate(&self, guid: &str, prop: &str, meta: &PropertyMeta) -> StorageResult<()> {
        validate_name(guid)?;
        validate_name(prop)?;
        let path = self.ensure_document(guid)?;
        let dir = path.join(prop);
        fs::create_dir_all(&dir)?;

        let active: BTreeSet<String> = match &meta.value {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => BTreeSet::new(),
        };

        for child in self.aggregated_children(guid, prop)? {
            if !active.contains(&child) {
                set_flag(&dir.join(&child), false)?;
            }
        }
        for child in &active {
            validate_name(child)?;
            let file = dir.join(child);
            if !file.exists() {
                fs::File::create(&file)?;
            }
            set_flag(&file, true)?;
        }

        write_atomic(&dir, AGGREGATE_META, &serde_json::to_vec(meta)?)?;
        touch(&path)?;
        Ok(())
    }

    /// Recursively removes a document.
    pub fn delete(&self, guid: &str) -> StorageResult<()> {
        let path = self.document_path(guid);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(guid = %guid, "Removed document");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(guid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists documents whose directory mtime is later than `since`, ordered by guid.
    pub fn walk(&self, since: SystemTime) -> StorageResult<Vec<Record>> {
        let mut records = Vec::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_entry(|entry| {
                // Shards are the first two guid characters, or the whole of a shorter guid.
                entry.depth() != 1
                    || (entry.file_type().is_dir() && matches!(entry.file_name().len(), 1 | 2))
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if !path.join(DOCUMENT_MARKER).is_file() {
                warn!("Skipping stray directory {:?}", path);
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified <= since {
                continue;
            }
            let guid = entry.file_name().to_string_lossy().into_owned();
            records.push(Record::new(guid, path.to_path_buf()));
        }

        records.sort_by(|a, b| a.guid().cmp(b.guid()));
        Ok(records)
    }

    pub fn blob_path(&self, guid: &str, prop: &str) -> PathBuf {
        self.document_path(guid)
            .join(format!("{}{}", prop, BLOB_SUFFIX))
    }

    /// Streams a BLOB payload into `<prop>.blob`, replacing any previous payload
    /// atomically. The property's metadata file is left for the caller to write.
    pub fn set_blob<R: Read>(&self, guid: &str, prop: &str, mut reader: R) -> StorageResult<BlobStat> {
        validate_name(guid)?;
        validate_name(prop)?;
        let path = self.ensure_document(guid)?;

        let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(&path)?;
        let mut hasher = Sha1::new();
        let mut size = 0u64;
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            let read = reader.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
            tmp.write_all(&chunk[..read])?;
            size += read as u64;
        }

        tmp.as_file().sync_all()?;
        tmp.persist(self.blob_path(guid, prop))
            .map_err(|e| StorageError::Io(e.error))?;
        touch(&path)?;

        let digest = hex::encode(hasher.finalize());
        debug!(guid = %guid, prop = %prop, size, digest = %digest, "Stored blob");
        Ok(BlobStat { size, digest })
    }

    /// Reads the whole BLOB payload, or `None` if there is none.
    pub fn get_blob(&self, guid: &str, prop: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut file = match fs::File::open(self.blob_path(guid, prop)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }
        Ok(Some(data))
    }

    /// Size and sha1 of the BLOB payload.
    pub fn stat_blob(&self, guid: &str, prop: &str) -> StorageResult<Option<BlobStat>> {
        let Some(data) = self.get_blob(guid, prop)? else {
            return Ok(None);
        };
        Ok(Some(BlobStat {
            size: data.len() as u64,
            digest: hex::encode(Sha1::digest(&data)),
        }))
    }

    /// Marks a child of an aggregated property as active.
    pub fn aggregate(&self, guid: &str, prop: &str, child: &str) -> StorageResult<()> {
        let file = self.child_path(guid, prop, child)?;
        if !file.exists() {
            fs::File::create(&file)?;
        }
        set_flag(&file, true)?;
        touch(&self.document_path(guid))?;
        Ok(())
    }

    /// Keeps a child recorded but clears its active flag.
    pub fn disaggregate(&self, guid: &str, prop: &str, child: &str) -> StorageResult<()> {
        let file = self.child_path(guid, prop, child)?;
        if !file.exists() {
            fs::File::create(&file)?;
        }
        set_flag(&file, false)?;
        touch(&self.document_path(guid))?;
        Ok(())
    }

    pub fn is_aggregated(&self, guid: &str, prop: &str, child: &str) -> StorageResult<bool> {
        let file = self.document_path(guid).join(prop).join(child);
        if !file.is_file() {
            return Ok(false);
        }
        Ok(get_flag(&file)?)
    }

    /// Number of active children.
    pub fn count_aggregated(&self, guid: &str, prop: &str) -> StorageResult<usize> {
        let mut count = 0;
        for child in self.aggregated_children(guid, prop)? {
            if self.is_aggregated(guid, prop, &child)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Every recorded child, active or not.
    pub fn aggregated_children(&self, guid: &str, prop: &str) -> StorageResult<Vec<String>> {
        let dir = self.document_path(guid).join(prop);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut children = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                children.push(name);
            }
        }
        children.sort();
        Ok(children)
    }

    fn child_path(&self, guid: &str, prop: &str, child: &str) -> StorageResult<PathBuf> {
        validate_name(guid)?;
        validate_name(prop)?;
        validate_name(child)?;
        let path = self.ensure_document(guid)?;
        let dir = path.join(prop);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(child))
    }

    fn ensure_document(&self, guid: &str) -> StorageResult<PathBuf> {
        let path = self.document_path(guid);
        fs::create_dir_all(&path)?;
        let marker = path.join(DOCUMENT_MARKER);
        if !marker.exists() {
            fs::File::create(&marker)?;
        }
        Ok(path)
    }
}

/// Rejects names that would escape or collide with the document layout.
pub fn validate_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(BLOB_SUFFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// Writes `name` inside `dir` through a temporary file and a rename.
pub(crate) fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> StorageResult<()> {
    let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name))
        .map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

pub(crate) fn touch(path: &Path) -> StorageResult<()> {
    filetime::set_file_mtime(path, FileTime::now())?;
    Ok(())
}

#[cfg(unix)]
fn set_flag(path: &Path, on: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    perms.set_mode(if on { mode | STICKY } else { mode & !STICKY });
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn get_flag(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    Ok(fs::metadata(path)?.permissions().mode() & STICKY != 0)
}

// Without a sticky bit the flag is the file being non-empty.
#[cfg(not(unix))]
fn set_flag(path: &Path, on: bool) -> std::io::Result<()> {
    fs::write(path, if on { &b"1"[..] } else { &b""[..] })
}

#[cfg(not(unix))]
fn get_flag(path: &Path) -> std::io::Result<bool> {
    Ok(fs::metadata(path)?.len() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Storage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().join("context"), 4096).unwrap();
        (temp_dir, storage)
    }

    fn props(pairs: &[(&str, serde_json::Value, i64, u64)]) -> BTreeMap<String, PropertyMeta> {
        pairs
            .iter()
            .map(|(name, value, mtime, seqno)| {
                (name.to_string(), PropertyMeta::new(value.clone(), *mtime, *seqno))
            })
            .collect()
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, storage) = setup();
        storage
            .put("abcdef", &props(&[("title", json!("x"), 10, 1), ("k", json!(3), 11, 2)]))
            .unwrap();

        let record = storage.get("abcdef").unwrap();
        assert_eq!(record.meta("title").unwrap().unwrap().value, json!("x"));
        assert_eq!(record.meta("missing").unwrap(), None);
        assert_eq!(record.seqno().unwrap(), 2);
        assert_eq!(record.mtime().unwrap(), 11);
        assert!(storage.root().join("ab/abcdef/.document").is_file());
    }

    #[test]
    fn test_get_missing_document() {
        let (_dir, storage) = setup();
        assert!(matches!(storage.get("nope12"), Err(StorageError::NotFound(_))));

        fs::create_dir_all(storage.document_path("stray1")).unwrap();
        assert!(matches!(storage.get("stray1"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_put_overwrites_atomically() {
        let (_dir, storage) = setup();
        storage.put("abcdef", &props(&[("k", json!(1), 1, 1)])).unwrap();
        storage.put("abcdef", &props(&[("k", json!(2), 2, 2)])).unwrap();

        let record = storage.get("abcdef").unwrap();
        assert_eq!(record.meta("k").unwrap().unwrap().value, json!(2));

        let leftovers: Vec<_> = fs::read_dir(storage.document_path("abcdef"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_delete() {
        let (_dir, storage) = setup();
        storage.put("abcdef", &props(&[("k", json!(1), 1, 1)])).unwrap();
        storage.delete("abcdef").unwrap();
        assert!(!storage.exists("abcdef"));
        assert!(matches!(storage.delete("abcdef"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_walk_since() {
        let (_dir, storage) = setup();
        storage.put("aa0001", &props(&[("k", json!(1), 1, 1)])).unwrap();
        storage.put("bb0002", &props(&[("k", json!(2), 1, 2)])).unwrap();
        fs::create_dir_all(storage.root().join("index/blobs")).unwrap();

        let all = storage.walk(UNIX_EPOCH).unwrap();
        let guids: Vec<_> = all.iter().map(|r| r.guid().to_string()).collect();
        assert_eq!(guids, vec!["aa0001", "bb0002"]);

        let old = FileTime::from_system_time(UNIX_EPOCH + Duration::from_secs(100));
        filetime::set_file_mtime(storage.document_path("aa0001"), old).unwrap();
        let recent = storage
            .walk(UNIX_EPOCH + Duration::from_secs(1000))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].guid(), "bb0002");
    }

    #[test]
    fn test_walk_finds_short_guids() {
        let (_dir, storage) = setup();
        storage.put("g", &props(&[("k", json!(1), 1, 1)])).unwrap();
        storage.put("ab", &props(&[("k", json!(2), 1, 2)])).unwrap();
        assert!(storage.root().join("g/g/.document").is_file());

        let guids: Vec<_> = storage
            .walk(UNIX_EPOCH)
            .unwrap()
            .iter()
            .map(|r| r.guid().to_string())
            .collect();
        assert_eq!(guids, vec!["ab", "g"]);
    }

    #[test]
    fn test_blob_roundtrip() {
        let (_dir, storage) = setup();
        let stat = storage.set_blob("abcdef", "icon", &b"hello"[..]).unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.digest, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(storage.get_blob("abcdef", "icon").unwrap().unwrap(), b"hello");
        assert_eq!(storage.stat_blob("abcdef", "icon").unwrap(), Some(stat));
        assert_eq!(storage.get_blob("abcdef", "other").unwrap(), None);
    }

    #[test]
    fn test_aggregates() {
        let (_dir, storage) = setup();
        storage.aggregate("abcdef", "votes", "u1").unwrap();
        storage.aggregate("abcdef", "votes", "u2").unwrap();
        storage.disaggregate("abcdef", "votes", "u1").unwrap();

        assert!(!storage.is_aggregated("abcdef", "votes", "u1").unwrap());
        assert!(storage.is_aggregated("abcdef", "votes", "u2").unwrap());
        assert!(!storage.is_aggregated("abcdef", "votes", "u3").unwrap());
        assert_eq!(storage.count_aggregated("abcdef", "votes").unwrap(), 1);
        assert_eq!(
            storage.aggregated_children("abcdef", "votes").unwrap(),
            vec!["u1", "u2"]
        );
    }

    #[test]
    fn test_put_aggregate_syncs_flags() {
        let (_dir, storage) = setup();
        storage
            .put_aggregate("abcdef", "votes", &PropertyMeta::new(json!(["a", "b"]), 1, 1))
            .unwrap();
        storage
            .put_aggregate("abcdef", "votes", &PropertyMeta::new(json!(["b"]), 2, 2))
            .unwrap();

        assert!(!storage.is_aggregated("abcdef", "votes", "a").unwrap());
        assert!(storage.is_aggregated("abcdef", "votes", "b").unwrap());
        let record = storage.get("abcdef").unwrap();
        assert_eq!(record.meta("votes").unwrap().unwrap().value, json!(["b"]));
        assert_eq!(record.all().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_names() {
        let (_dir, storage) = setup();
        assert!(storage.put("../etc", &BTreeMap::new()).is_err());
        assert!(storage.put(".hidden", &BTreeMap::new()).is_err());
        assert!(storage
            .put("abcdef", &props(&[("x.blob", json!(1), 1, 1)]))
            .is_err());
    }
}
