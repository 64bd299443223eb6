//! Sled-backed committed index.
//!
//! Three trees hold one resource's committed state:
//! - `docs`: guid to the bincode-encoded [`IndexedDoc`]
//! - `terms`: `{term}\0{guid}` posting keys
//! - `slots`: `{slot_be}{sortable value}\0{guid}` range keys, valued by guid
//!
//! Only the writer thread calls [`IndexBackend::apply`]. Readers query the trees
//! directly; the pending cache covers the window between a write and its commit.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use tracing::{debug, info, warn};

use super::document::{exact_key, word_key, IndexedDoc, SortKey};
use super::query::{normalize, resolve, Query};
use super::{IndexError, IndexResult};
use crate::metadata::Metadata;

const MTIME_FILE: &str = "mtime";

/// The committed index of one resource.
pub struct IndexBackend {
    /// The sled database instance
    db: sled::Db,

    /// guid -> IndexedDoc
    docs: sled::Tree,

    /// Posting keys
    terms: sled::Tree,

    /// Sortable slot keys for range scans
    slots: sled::Tree,

    /// Index directory
    path: PathBuf,
}

impl IndexBackend {
    /// Opens the index at `path`.
    ///
    /// A database that fails to open or decode is removed and recreated empty; the
    /// returned flag tells the caller to repopulate it. A second failure is fatal.
    pub fn open(path: impl Into<PathBuf>) -> IndexResult<(Arc<Self>, bool)> {
        let path = path.into();
        match Self::open_once(&path) {
            Ok(backend) => Ok((Arc::new(backend), false)),
            Err(e) => {
                warn!("Index at {:?} is unusable, rebuilding: {}", path, e);
                match fs::remove_dir_all(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let backend = Self::open_once(&path)
                    .map_err(|e| IndexError::Corrupted(format!("{:?}: {}", path, e)))?;
                info!("Recreated index at {:?}", path);
                Ok((Arc::new(backend), true))
            }
        }
    }

    fn open_once(path: &Path) -> IndexResult<Self> {
        debug!("Opening index at {:?}", path);
        fs::create_dir_all(path)?;

        let db = sled::Config::new().path(path).open()?;
        let docs = db.open_tree("docs")?;
        let terms = db.open_tree("terms")?;
        let slots = db.open_tree("slots")?;

        if let Some(entry) = docs.iter().next() {
            let (_, value) = entry?;
            bincode::deserialize::<IndexedDoc>(&value)?;
        }

        Ok(Self {
            db,
            docs,
            terms,
            slots,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time of the last successful commit.
    pub fn mtime(&self) -> SystemTime {
        fs::metadata(self.path.join(MTIME_FILE))
            .and_then(|m| m.modified())
            .unwrap_or(UNIX_EPOCH)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, guid: &str) -> IndexResult<Option<IndexedDoc>> {
        match self.docs.get(guid.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Applies a batch of staged changes: `Some(doc)` stores, `None` removes.
    pub fn apply(&self, changes: &BTreeMap<String, Option<IndexedDoc>>) -> IndexResult<()> {
        let mut docs = sled::Batch::default();
        let mut terms = sled::Batch::default();
        let mut slots = sled::Batch::default();

        for (guid, change) in changes {
            if let Some(old) = self.get(guid)? {
                for term in old.terms.keys() {
                    terms.remove(posting_key(term, guid));
                }
                for (slot, key) in &old.slots {
                    slots.remove(slot_key(*slot, key, guid));
                }
            }

            match change {
                Some(doc) => {
                    for term in doc.terms.keys() {
                        terms.insert(posting_key(term, guid), sled::IVec::default());
                    }
                    for (slot, key) in &doc.slots {
                        slots.insert(slot_key(*slot, key, guid), guid.as_bytes());
                    }
                    docs.insert(guid.as_bytes(), bincode::serialize(doc)?);
                }
                None => docs.remove(guid.as_bytes()),
            }
        }

        self.terms.apply_batch(terms)?;
        self.slots.apply_batch(slots)?;
        self.docs.apply_batch(docs)?;
        Ok(())
    }

    /// Flushes to disk and records the commit time.
    pub fn flush(&self) -> IndexResult<()> {
        self.db.flush()?;
        let mtime = self.path.join(MTIME_FILE);
        if !mtime.exists() {
            fs::File::create(&mtime)?;
        }
        filetime::set_file_mtime(&mtime, FileTime::now())?;
        Ok(())
    }

    /// Drops every entry.
    pub fn clear(&self) -> IndexResult<()> {
        self.docs.clear()?;
        self.terms.clear()?;
        self.slots.clear()?;
        self.db.flush()?;
        let mtime = self.path.join(MTIME_FILE);
        match fs::remove_file(&mtime) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn all_guids(&self) -> IndexResult<BTreeSet<String>> {
        let mut guids = BTreeSet::new();
        for key in self.docs.iter().keys() {
            guids.insert(String::from_utf8_lossy(&key?).into_owned());
        }
        Ok(guids)
    }

    /// Evaluates a query to the set of matching committed guids.
    pub fn search(&self, query: &Query, metadata: &Metadata) -> IndexResult<BTreeSet<String>> {
        match query {
            Query::All => self.all_guids(),
            Query::Word { prop: None, word } => self.postings(&word_key("", word)),
            Query::Word {
                prop: Some(name),
                word,
            } => {
                let prop = resolve(metadata, name)?;
                match &prop.prefix {
                    Some(prefix) => {
                        let mut guids = self.postings(&word_key(prefix, word))?;
                        guids.extend(self.postings(&exact_key(prefix, word))?);
                        Ok(guids)
                    }
                    None => Ok(BTreeSet::new()),
                }
            }
            Query::Phrase { prop, words } => {
                let prefix = match prop {
                    Some(name) => match &resolve(metadata, name)?.prefix {
                        Some(prefix) => prefix.clone(),
                        None => return Ok(BTreeSet::new()),
                    },
                    None => String::new(),
                };
                let mut candidates: Option<BTreeSet<String>> = None;
                for word in words {
                    let postings = self.postings(&word_key(&prefix, word))?;
                    candidates = Some(match candidates {
                        Some(set) => set.intersection(&postings).cloned().collect(),
                        None => postings,
                    });
                }
                let mut matched = BTreeSet::new();
                for guid in candidates.unwrap_or_default() {
                    if let Some(doc) = self.get(&guid)? {
                        if doc.has_phrase(&prefix, words) {
                            matched.insert(guid);
                        }
                    }
                }
                Ok(matched)
            }
            Query::Exact { prop: name, value } => {
                let prop = resolve(metadata, name)?;
                let value = normalize(prop, value);
                match (&prop.prefix, prop.slot) {
                    (Some(prefix), _) => self.postings(&exact_key(prefix, &value)),
                    (None, Some(slot)) => {
                        let bound = Some(value.as_str());
                        self.slot_range(slot, bound, bound, &prop.typecast)
                    }
                    (None, None) => Ok(BTreeSet::new()),
                }
            }
            Query::Range {
                prop: name,
                from,
                to,
            } => {
                let prop = resolve(metadata, name)?;
                let slot = prop
                    .slot
                    .ok_or_else(|| IndexError::Query(format!("{} has no slot", name)))?;
                self.slot_range(slot, from.as_deref(), to.as_deref(), &prop.typecast)
            }
            Query::And(items) => {
                let (negative, positive): (Vec<&Query>, Vec<&Query>) =
                    items.iter().partition(|q| matches!(q, Query::Not(_)));

                let mut result: Option<BTreeSet<String>> = None;
                for item in positive {
                    let guids = self.search(item, metadata)?;
                    result = Some(match result {
                        Some(set) => set.intersection(&guids).cloned().collect(),
                        None => guids,
                    });
                    if result.as_ref().map_or(false, BTreeSet::is_empty) {
                        return Ok(BTreeSet::new());
                    }
                }
                let mut result = match result {
                    Some(set) => set,
                    None => self.all_guids()?,
                };
                for item in negative {
                    if let Query::Not(inner) = item {
                        for guid in self.search(inner, metadata)? {
                            result.remove(&guid);
                        }
                    }
                }
                Ok(result)
            }
            Query::Or(items) => {
                let mut result = BTreeSet::new();
                for item in items {
                    result.extend(self.search(item, metadata)?);
                }
                Ok(result)
            }
            Query::Not(inner) => {
                let excluded = self.search(inner, metadata)?;
                Ok(self
                    .all_guids()?
                    .into_iter()
                    .filter(|guid| !excluded.contains(guid))
                    .collect())
            }
        }
    }

    fn postings(&self, term: &str) -> IndexResult<BTreeSet<String>> {
        let prefix = posting_key(term, "");
        let mut guids = BTreeSet::new();
        for key in self.terms.scan_prefix(&prefix).keys() {
            let key = key?;
            guids.insert(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(guids)
    }

    fn slot_range(
        &self,
        slot: u32,
        from: Option<&str>,
        to: Option<&str>,
        typecast: &crate::metadata::Typecast,
    ) -> IndexResult<BTreeSet<String>> {
        let slot_prefix = slot.to_be_bytes();
        let mut start = slot_prefix.to_vec();
        if let Some(from) = from {
            start.extend(SortKey::parse_bound(from, typecast).encode());
        }
        let upper = to.map(|to| SortKey::parse_bound(to, typecast).encode());

        let mut guids = BTreeSet::new();
        for entry in self.slots.range(start..) {
            let (key, guid) = entry?;
            if !key.starts_with(&slot_prefix) {
                break;
            }
            let value_end = key.len().saturating_sub(guid.len() + 1);
            if value_end < slot_prefix.len() {
                return Err(IndexError::Corrupted("malformed slot key".to_string()));
            }
            let value = &key[slot_prefix.len()..value_end];
            if let Some(upper) = &upper {
                if value > upper.as_slice() {
                    break;
                }
            }
            guids.insert(String::from_utf8_lossy(&guid).into_owned());
        }
        Ok(guids)
    }
}

fn posting_key(term: &str, guid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + guid.len() + 1);
    key.extend_from_slice(term.as_bytes());
    key.push(0);
    key.extend_from_slice(guid.as_bytes());
    key
}

fn slot_key(slot: u32, value: &SortKey, guid: &str) -> Vec<u8> {
    let mut key = slot.to_be_bytes().to_vec();
    key.extend(value.encode());
    key.push(0);
    key.extend_from_slice(guid.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::query::parse;
    use crate::metadata::{PropertyDescriptor, Typecast};
    use serde_json::json;
    use tempfile::TempDir;

    fn metadata() -> Metadata {
        Metadata::new(
            "context",
            vec![
                PropertyDescriptor::new("title", Typecast::Str)
                    .slot(10)
                    .prefix("T")
                    .full_text(),
                PropertyDescriptor::new("k", Typecast::Int).slot(11).prefix("K").boolean(),
                PropertyDescriptor::new("name", Typecast::Str).slot(12),
            ],
        )
        .unwrap()
    }

    fn doc(guid: &str, title: &str, k: i64) -> IndexedDoc {
        let values: BTreeMap<String, serde_json::Value> = serde_json::from_value(json!({
            "guid": guid,
            "title": title,
            "k": k,
            "name": title,
            "layer": ["public"],
        }))
        .unwrap();
        IndexedDoc::build(&metadata(), guid, &values, "en")
    }

    fn setup() -> (TempDir, Arc<IndexBackend>) {
        let temp_dir = TempDir::new().unwrap();
        let (backend, rebuilt) = IndexBackend::open(temp_dir.path().join("index")).unwrap();
        assert!(!rebuilt);
        (temp_dir, backend)
    }

    fn store(backend: &IndexBackend, docs: Vec<IndexedDoc>) {
        let changes = docs.into_iter().map(|d| (d.guid.clone(), Some(d))).collect();
        backend.apply(&changes).unwrap();
    }

    fn search(backend: &IndexBackend, query: &str) -> Vec<String> {
        backend
            .search(&parse(query).unwrap(), &metadata())
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_apply_and_get() {
        let (_dir, backend) = setup();
        store(&backend, vec![doc("g1", "quick fox", 1), doc("g2", "lazy dog", 2)]);
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.get("g1").unwrap().unwrap().guid, "g1");
        assert!(backend.get("g3").unwrap().is_none());
    }

    #[test]
    fn test_search_terms() {
        let (_dir, backend) = setup();
        store(&backend, vec![doc("g1", "quick fox", 1), doc("g2", "lazy dog", 2)]);
        assert_eq!(search(&backend, "fox"), vec!["g1"]);
        assert_eq!(search(&backend, "fox OR dog"), vec!["g1", "g2"]);
        assert_eq!(search(&backend, "NOT fox"), vec!["g2"]);
        assert_eq!(search(&backend, "\"quick fox\""), vec!["g1"]);
        assert!(search(&backend, "\"fox quick\"").is_empty());
        assert_eq!(search(&backend, "k:=2"), vec!["g2"]);
    }

    #[test]
    fn test_search_ranges() {
        let (_dir, backend) = setup();
        store(
            &backend,
            vec![doc("g1", "a", -5), doc("g2", "b", 3), doc("g3", "c", 10)],
        );
        assert_eq!(search(&backend, "k:-10..3"), vec!["g1", "g2"]);
        assert_eq!(search(&backend, "k:4.."), vec!["g3"]);
        assert_eq!(search(&backend, "k:..100"), vec!["g1", "g2", "g3"]);
        assert_eq!(search(&backend, "name:a..b"), vec!["g1", "g2"]);
        assert_eq!(search(&backend, "name:=c"), vec!["g3"]);
    }

    #[test]
    fn test_update_replaces_terms() {
        let (_dir, backend) = setup();
        store(&backend, vec![doc("g1", "quick fox", 1)]);
        store(&backend, vec![doc("g1", "lazy dog", 1)]);
        assert!(search(&backend, "fox").is_empty());
        assert_eq!(search(&backend, "dog"), vec!["g1"]);

        let mut changes = BTreeMap::new();
        changes.insert("g1".to_string(), None);
        backend.apply(&changes).unwrap();
        assert!(search(&backend, "dog").is_empty());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_flush_records_mtime() {
        let (_dir, backend) = setup();
        assert_eq!(backend.mtime(), UNIX_EPOCH);
        backend.flush().unwrap();
        assert!(backend.mtime() > UNIX_EPOCH);
        backend.clear().unwrap();
        assert_eq!(backend.mtime(), UNIX_EPOCH);
    }

    #[test]
    fn test_open_rebuilds_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        {
            let db = sled::open(&path).unwrap();
            let docs = db.open_tree("docs").unwrap();
            docs.insert("g1", &b"\xff"[..]).unwrap();
            db.flush().unwrap();
        }

        let (backend, rebuilt) = IndexBackend::open(&path).unwrap();
        assert!(rebuilt);
        assert!(backend.is_empty());
    }
}
