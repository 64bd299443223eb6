//! One resource bound to its storage and its index.
//!
//! A [`Directory`] is the only way documents are created, changed or removed. Every
//! mutation travels through the resource's [`IndexWriter`]; the directory supplies the
//! writer with [`StoreHooks`] that complete the write from storage, stamp it with the
//! volume seqno and, once the index accepted it, persist the property files and
//! announce the change.

pub mod document;
pub mod sync;

pub use document::{negotiate, Document};
pub use sync::{wins, Diff, DiffRecord};

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{
    new_pending_cache, FindRequest, IndexBackend, IndexError, IndexProxy, IndexWriter,
    IndexedDoc, PutWait, StoreHooks, StoreKind, StoreOp, WriterConfig,
};
use crate::metadata::{
    BlobRef, Metadata, Permission, PropertyDescriptor, ValidateMode, ValidationFailure, CTIME,
    GUID, LAYER, MTIME, SEQNO,
};
use crate::storage::fs::validate_name;
use crate::storage::{PropertyMeta, Record, Storage, StorageError};
use crate::volume::{Event, EventHub, EventKind, Seqno};

/// Index directory inside a resource root.
pub const INDEX_DIR: &str = "index";

/// Layer tag marking a soft-deleted document.
pub const DELETED: &str = "deleted";

/// Wall-clock seconds.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A BLOB payload with its reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub meta: BlobRef,
    pub mtime: i64,
    pub data: Vec<u8>,
}

/// Callbacks run by the writer thread.
struct DirectoryHooks {
    resource: String,
    metadata: Arc<Metadata>,
    storage: Storage,
    seqno: Arc<Seqno>,
    events: Arc<EventHub>,
}

impl DirectoryHooks {
    /// Values fed to the indexer: stored properties plus the derived `mtime`/`seqno`.
    fn index_values(
        &self,
        props: &BTreeMap<String, PropertyMeta>,
    ) -> BTreeMap<String, serde_json::Value> {
        let mut values: BTreeMap<String, serde_json::Value> = props
            .iter()
            .map(|(name, meta)| (name.clone(), meta.value.clone()))
            .collect();
        let mtime = props.values().map(|m| m.mtime).max().unwrap_or(0);
        let seqno = props.values().map(|m| m.seqno).max().unwrap_or(0);
        values.insert(MTIME.to_string(), serde_json::json!(mtime));
        values.insert(SEQNO.to_string(), serde_json::json!(seqno));
        values
    }

    fn is_aggregated(&self, name: &str) -> bool {
        self.metadata.get(name).map_or(false, |prop| prop.aggregated)
    }
}

impl StoreHooks for DirectoryHooks {
    fn pre_store(&self, op: &mut StoreOp) -> Result<Option<BTreeMap<String, serde_json::Value>>> {
        let mut current = if self.storage.exists(&op.guid) {
            op.existed = true;
            self.storage.get(&op.guid)?.all()?
        } else {
            op.existed = false;
            BTreeMap::new()
        };

        match op.kind {
            StoreKind::Create if op.existed => {
                return Err(Error::Conflict(format!("{} already exists", op.guid)));
            }
            StoreKind::Update | StoreKind::SoftDelete if !op.existed => {
                return Err(Error::NotFound(op.guid.clone()));
            }
            StoreKind::Populate => {
                if !op.existed {
                    return Ok(None);
                }
                op.props.clear();
                self.seqno
                    .observe(current.values().map(|m| m.seqno).max().unwrap_or(0));
                return Ok(Some(self.index_values(&current)));
            }
            StoreKind::Merge { touch } => {
                op.props.retain(|name, incoming| {
                    current.get(name).map_or(true, |local| wins(incoming, local))
                });
                let props = &op.props;
                op.blobs.retain(|name, _| props.contains_key(name));
                if op.props.is_empty() {
                    return Ok(None);
                }
                if touch {
                    let seqno = self.seqno.next();
                    for meta in op.props.values_mut() {
                        meta.seqno = seqno;
                    }
                }
            }
            StoreKind::SoftDelete => {
                let mut layers: Vec<String> = current
                    .get(LAYER)
                    .and_then(|meta| serde_json::from_value(meta.value.clone()).ok())
                    .unwrap_or_default();
                if layers.iter().any(|layer| layer == DELETED) {
                    return Ok(None);
                }
                layers.push(DELETED.to_string());
                let mtime = now();
                op.props.clear();
                op.props.insert(
                    LAYER.to_string(),
                    PropertyMeta::new(serde_json::json!(layers), mtime, self.seqno.next()),
                );
            }
            StoreKind::Create | StoreKind::Update => {
                let seqno = self.seqno.next();
                let mtime = now();
                for meta in op.props.values_mut() {
                    meta.mtime = mtime;
                    meta.seqno = seqno;
                }
                if op.kind == StoreKind::Create {
                    if let Some(ctime) = op.props.get_mut(CTIME) {
                        ctime.value = serde_json::json!(mtime);
                    }
                }
            }
        }

        for (name, meta) in &op.props {
            current.insert(name.clone(), meta.clone());
        }
        Ok(Some(self.index_values(&current)))
    }

    fn post_store(&self, op: &StoreOp, _doc: &IndexedDoc) -> Result<()> {
        if op.kind == StoreKind::Populate {
            return Ok(());
        }

        for (name, data) in &op.blobs {
            self.storage.set_blob(&op.guid, name, data.as_slice())?;
        }

        let mut plain = BTreeMap::new();
        for (name, meta) in &op.props {
            if self.is_aggregated(name) {
                self.storage.put_aggregate(&op.guid, name, meta)?;
            } else {
                plain.insert(name.clone(), meta.clone());
            }
        }
        if !plain.is_empty() {
            self.storage.put(&op.guid, &plain)?;
        }

        let kind = if op.existed {
            EventKind::Update
        } else {
            EventKind::Create
        };
        let props = op
            .props
            .iter()
            .map(|(name, meta)| (name.clone(), meta.value.clone()))
            .collect();
        let seqno = op.props.values().map(|m| m.seqno).max().unwrap_or(0);
        self.events.publish(
            Event::new(kind, &self.resource)
                .guid(&op.guid)
                .props(props)
                .seqno(seqno),
        );
        Ok(())
    }

    fn post_delete(&self, guid: &str) -> Result<()> {
        self.storage.delete(guid).map_err(|e| match e {
            StorageError::NotFound(guid) => Error::NotFound(guid),
            other => other.into(),
        })?;
        self.events
            .publish(Event::new(EventKind::Delete, &self.resource).guid(guid));
        Ok(())
    }

    fn on_commit(&self, commit: u64) {
        if let Err(e) = self.seqno.commit() {
            error!(resource = %self.resource, "Failed to persist seqno: {}", e);
        }
        debug!(resource = %self.resource, commit, "Commit event");
        self.events
            .publish(Event::new(EventKind::Commit, &self.resource).seqno(self.seqno.current()));
    }

    fn on_fatal(&self, error: &IndexError) {
        error!(resource = %self.resource, "Index writer died: {}", error);
        self.events
            .publish(Event::new(EventKind::WriterDied, &self.resource));
    }
}

/// Storage, index and writer of one resource.
pub struct Directory {
    metadata: Arc<Metadata>,
    storage: Storage,
    writer: IndexWriter,
    proxy: IndexProxy,
    seqno: Arc<Seqno>,
    config: Arc<Config>,

    /// The index was recreated empty and needs a full populate
    rebuilt: AtomicBool,
}

impl Directory {
    /// Opens `<volume_root>/<resource>` and starts its writer.
    pub fn open(
        volume_root: &Path,
        metadata: Metadata,
        seqno: Arc<Seqno>,
        events: Arc<EventHub>,
        config: Arc<Config>,
    ) -> Result<Self> {
        let resource = metadata.name().to_string();
        let metadata = Arc::new(metadata);
        let storage = Storage::open(volume_root.join(&resource), config.blob_chunk_size)?;

        let (backend, rebuilt) = IndexBackend::open(storage.root().join(INDEX_DIR))?;
        if rebuilt {
            info!(resource = %resource, "Index was recreated, documents will be repopulated");
        }

        let pending = new_pending_cache();
        let hooks = Arc::new(DirectoryHooks {
            resource: resource.clone(),
            metadata: metadata.clone(),
            storage: storage.clone(),
            seqno: seqno.clone(),
            events,
        });
        let writer = IndexWriter::spawn(
            resource.clone(),
            backend.clone(),
            metadata.clone(),
            pending.clone(),
            hooks,
            WriterConfig {
                queue_size: config.write_queue_size,
                flush_threshold: config.flush_threshold,
                flush_timeout: config.flush_timeout,
                default_language: config.default_language.clone(),
            },
        )?;
        let proxy = IndexProxy::new(backend, metadata.clone(), pending, config.languages.clone());

        debug!(resource = %resource, "Opened directory");
        Ok(Self {
            metadata,
            storage,
            writer,
            proxy,
            seqno,
            config,
            rebuilt: AtomicBool::new(rebuilt),
        })
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Watch over the commit counter.
    pub fn commits(&self) -> watch::Receiver<u64> {
        self.writer.commits()
    }

    pub fn is_alive(&self) -> bool {
        self.writer.is_alive()
    }

    /// Creates a document and returns its guid.
    pub async fn create(&self, props: serde_json::Map<String, serde_json::Value>) -> Result<String> {
        let guid = match props.get(GUID) {
            Some(serde_json::Value::String(guid)) => guid.clone(),
            Some(other) => return Err(Error::InvalidValue(format!("bad guid {}", other))),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        validate_name(&guid).map_err(|e| Error::InvalidValue(e.to_string()))?;
        self.check_permissions(&props, Permission::CREATE)?;

        let typed = self
            .metadata
            .validate(&props, ValidateMode::Create, &self.config.default_language)
            .map_err(invalid)?;

        let mut op = StoreOp::new(&guid, StoreKind::Create);
        for (name, value) in typed {
            op.props
                .insert(name, PropertyMeta::new(value.to_json(), 0, 0));
        }
        op.props
            .insert(GUID.to_string(), PropertyMeta::new(serde_json::json!(guid), 0, 0));
        op.props
            .insert(CTIME.to_string(), PropertyMeta::new(serde_json::json!(now()), 0, 0));

        self.writer.store(op).await?;
        debug!(resource = %self.name(), guid = %guid, "Created document");
        Ok(guid)
    }

    /// Writes `props` into an existing document.
    pub async fn update(
        &self,
        guid: &str,
        props: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.require(guid)?;
        self.check_permissions(&props, Permission::WRITE)?;
        let typed = self
            .metadata
            .validate(&props, ValidateMode::Update, &self.config.default_language)
            .map_err(invalid)?;
        if typed.is_empty() {
            return Ok(());
        }

        let mut op = StoreOp::new(guid, StoreKind::Update);
        for (name, value) in typed {
            op.props
                .insert(name, PropertyMeta::new(value.to_json(), 0, 0));
        }
        self.writer.store(op).await?;
        Ok(())
    }

    /// Removes a document: physically when `raw`, otherwise by tagging it `deleted`.
    pub async fn delete(&self, guid: &str, raw: bool) -> Result<()> {
        if raw {
            self.writer.delete(guid).await?;
            info!(resource = %self.name(), guid = %guid, "Removed document");
            return Ok(());
        }

        self.require(guid)?;
        let op = StoreOp::new(guid, StoreKind::SoftDelete);
        if !self.writer.store(op).await? {
            return Ok(());
        }
        debug!(resource = %self.name(), guid = %guid, "Soft-deleted document");
        Ok(())
    }

    /// Document view; properties are read on demand.
    pub fn get(&self, guid: &str) -> Result<Document> {
        let record = self.require(guid)?;
        Ok(Document::new(
            record,
            self.metadata.clone(),
            None,
            None,
            self.config.default_language.clone(),
        ))
    }

    /// Runs a find and returns the page of documents with the total row count.
    pub fn find(&self, request: &FindRequest) -> Result<(Vec<Document>, usize)> {
        let result = self.proxy.find(request).map_err(query_error)?;
        let documents = result
            .hits
            .into_iter()
            .map(|hit| {
                let record = Record::new(&hit.doc.guid, self.storage.document_path(&hit.doc.guid));
                Document::new(
                    record,
                    self.metadata.clone(),
                    Some(hit.doc),
                    hit.grouped,
                    self.config.default_language.clone(),
                )
            })
            .collect();
        Ok((documents, result.total))
    }

    /// Largest document seqno known to the index.
    pub fn max_seqno(&self) -> Result<u64> {
        let request = FindRequest {
            order_by: vec![format!("-{}", SEQNO)],
            limit: Some(1),
            include_deleted: true,
            ..Default::default()
        };
        let result = self.proxy.find(&request)?;
        Ok(result
            .hits
            .first()
            .and_then(|hit| hit.doc.prop(SEQNO))
            .and_then(|value| value.as_u64())
            .unwrap_or(0))
    }

    pub async fn get_blob(&self, guid: &str, prop: &str) -> Result<Blob> {
        let desc = self.blob_property(prop)?;
        if !desc.permissions.contains(Permission::READ) {
            return Err(Error::PermissionDenied(format!("{} is not readable", prop)));
        }
        let (meta, blob) = self.blob_meta(guid, prop)?;
        if blob.digest.is_empty() {
            return match blob.url {
                Some(url) => Err(Error::Redirect(url)),
                None => Err(Error::NotFound(format!("{}/{}", guid, prop))),
            };
        }

        let storage = self.storage.clone();
        let (g, p) = (guid.to_string(), prop.to_string());
        let data = tokio::task::spawn_blocking(move || storage.get_blob(&g, &p))
            .await
            .map_err(join_error)??;

        match (data, blob.url.clone()) {
            (Some(data), _) => Ok(Blob {
                meta: blob,
                mtime: meta.mtime,
                data,
            }),
            (None, Some(url)) => Err(Error::Redirect(url)),
            (None, None) => Err(Error::NotFound(format!("{}/{}", guid, prop))),
        }
    }

    /// Streams a new BLOB payload, then records its reference through the writer.
    pub async fn set_blob<R>(
        &self,
        guid: &str,
        prop: &str,
        reader: R,
        mime_type: Option<String>,
    ) -> Result<BlobRef>
    where
        R: Read + Send + 'static,
    {
        let desc = self.blob_property(prop)?;
        if !desc.permissions.contains(Permission::WRITE) {
            return Err(Error::PermissionDenied(format!("{} is not writable", prop)));
        }
        self.require(guid)?;

        let storage = self.storage.clone();
        let (g, p) = (guid.to_string(), prop.to_string());
        let stat = tokio::task::spawn_blocking(move || storage.set_blob(&g, &p, reader))
            .await
            .map_err(join_error)??;

        let blob = BlobRef {
            digest: stat.digest,
            size: stat.size,
            mime_type: mime_type
                .or_else(|| desc.mime_type.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            url: None,
        };
        let mut op = StoreOp::new(guid, StoreKind::Update);
        op.props
            .insert(prop.to_string(), PropertyMeta::new(serde_json::to_value(&blob)?, 0, 0));
        self.writer.store(op).await?;
        Ok(blob)
    }

    pub fn stat_blob(&self, guid: &str, prop: &str) -> Result<BlobRef> {
        self.blob_property(prop)?;
        Ok(self.blob_meta(guid, prop)?.1)
    }

    /// Activates `child` in an aggregated property.
    pub async fn aggregate(&self, guid: &str, prop: &str, child: &str) -> Result<()> {
        self.set_aggregated(guid, prop, child, true).await
    }

    /// Deactivates `child`, keeping it recorded.
    pub async fn disaggregate(&self, guid: &str, prop: &str, child: &str) -> Result<()> {
        self.set_aggregated(guid, prop, child, false).await
    }

    pub fn is_aggregated(&self, guid: &str, prop: &str, child: &str) -> Result<bool> {
        self.aggregated_property(prop)?;
        self.require(guid)?;
        Ok(self.storage.is_aggregated(guid, prop, child)?)
    }

    pub fn count_aggregated(&self, guid: &str, prop: &str) -> Result<usize> {
        self.aggregated_property(prop)?;
        self.require(guid)?;
        Ok(self.storage.count_aggregated(guid, prop)?)
    }

    /// Re-indexes documents touched after the last index commit, one per step.
    pub fn populate(&self) -> Result<Populator<'_>> {
        let since = if self.rebuilt.swap(false, Ordering::SeqCst) {
            UNIX_EPOCH
        } else {
            self.proxy.backend().mtime()
        };
        let records: VecDeque<Record> = self.storage.walk(since)?.into();
        if !records.is_empty() {
            info!(resource = %self.name(), documents = records.len(), "Populating index");
        }
        Ok(Populator {
            directory: self,
            records,
            done: 0,
        })
    }

    /// Drops the index and replays every stored document into it.
    pub async fn rebuild_index(&self) -> Result<usize> {
        info!(resource = %self.name(), "Rebuilding index");
        if let PutWait::Done(cleared) = self
            .writer
            .put_wait(u64::MAX, |backend| backend.clear())
            .await?
        {
            cleared?;
        }
        self.rebuilt.store(true, Ordering::SeqCst);
        self.populate()?.run().await
    }

    /// Commits pending index writes and returns the commit counter.
    pub async fn commit(&self) -> Result<u64> {
        self.writer.commit_and_wait().await
    }

    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }

    async fn set_aggregated(&self, guid: &str, prop: &str, child: &str, active: bool) -> Result<()> {
        let desc = self.aggregated_property(prop)?;
        if !desc.permissions.contains(Permission::WRITE) {
            return Err(Error::PermissionDenied(format!("{} is not writable", prop)));
        }
        validate_name(child).map_err(|e| Error::InvalidValue(e.to_string()))?;
        let record = self.require(guid)?;

        let mut children: Vec<String> = record
            .meta(prop)?
            .and_then(|meta| serde_json::from_value(meta.value).ok())
            .unwrap_or_default();
        let present = children.iter().any(|c| c == child);
        match (active, present) {
            (true, false) => children.push(child.to_string()),
            (false, true) => children.retain(|c| c != child),
            _ => {
                // Value unchanged; still record a disabled child on disk.
                if !active && !self.storage.is_aggregated(guid, prop, child)? {
                    self.storage.disaggregate(guid, prop, child)?;
                }
                return Ok(());
            }
        }
        children.sort();

        let mut op = StoreOp::new(guid, StoreKind::Update);
        op.props
            .insert(prop.to_string(), PropertyMeta::new(serde_json::json!(children), 0, 0));
        self.writer.store(op).await?;
        Ok(())
    }

    fn require(&self, guid: &str) -> Result<Record> {
        self.storage.get(guid).map_err(|e| match e {
            StorageError::NotFound(guid) => Error::NotFound(guid),
            other => other.into(),
        })
    }

    fn check_permissions(
        &self,
        props: &serde_json::Map<String, serde_json::Value>,
        needed: Permission,
    ) -> Result<()> {
        for name in props.keys() {
            if let Some(prop) = self.metadata.get(name) {
                if !prop.permissions.contains(needed) {
                    return Err(Error::PermissionDenied(format!(
                        "{} cannot be written",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    fn blob_property(&self, prop: &str) -> Result<&PropertyDescriptor> {
        let desc = self.metadata.require(prop)?;
        if !desc.blob {
            return Err(Error::InvalidValue(format!("{} is not a blob", prop)));
        }
        Ok(desc)
    }

    fn aggregated_property(&self, prop: &str) -> Result<&PropertyDescriptor> {
        let desc = self.metadata.require(prop)?;
        if !desc.aggregated {
            return Err(Error::InvalidValue(format!("{} is not aggregated", prop)));
        }
        Ok(desc)
    }

    fn blob_meta(&self, guid: &str, prop: &str) -> Result<(PropertyMeta, BlobRef)> {
        let record = self.require(guid)?;
        let meta = record
            .meta(prop)?
            .ok_or_else(|| Error::NotFound(format!("{}/{}", guid, prop)))?;
        match serde_json::from_value::<BlobRef>(meta.value.clone()) {
            Ok(blob) if !blob.digest.is_empty() || blob.url.is_some() => Ok((meta, blob)),
            _ => Err(Error::NotFound(format!("{}/{}", guid, prop))),
        }
    }
}

/// Cooperative index repopulation; each step indexes one document and yields.
pub struct Populator<'a> {
    directory: &'a Directory,
    records: VecDeque<Record>,
    done: usize,
}

impl Populator<'_> {
    pub fn remaining(&self) -> usize {
        self.records.len()
    }

    /// Indexes the next document and returns its guid, or `None` when finished.
    pub async fn step(&mut self) -> Result<Option<String>> {
        let Some(record) = self.records.pop_front() else {
            return Ok(None);
        };
        let op = StoreOp::new(record.guid(), StoreKind::Populate);
        match self.directory.writer.store(op).await {
            Ok(_) => self.done += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(
                resource = %self.directory.name(),
                guid = %record.guid(),
                "Cannot populate document: {}", e
            ),
        }
        tokio::task::yield_now().await;
        Ok(Some(record.guid().to_string()))
    }

    /// Runs every step and commits.
    pub async fn run(mut self) -> Result<usize> {
        while self.step().await?.is_some() {}
        if self.done > 0 {
            self.directory.commit().await?;
            info!(resource = %self.directory.name(), documents = self.done, "Populated index");
        }
        Ok(self.done)
    }
}

fn invalid(failures: Vec<ValidationFailure>) -> Error {
    let reasons: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.property, f.reason))
        .collect();
    Error::InvalidValue(reasons.join("; "))
}

fn query_error(e: IndexError) -> Error {
    match e {
        IndexError::Query(message) => Error::InvalidValue(message),
        other => other.into(),
    }
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}
