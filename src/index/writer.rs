//! Single-writer index queue.
//!
//! One OS thread per resource owns all index mutation. Callers enqueue work through a
//! FIFO whose capacity is enforced by a fair semaphore: the permit is taken before the
//! item gets its queue seqno and travels with the item until the writer dequeues it,
//! so a cancelled `put` never holds a slot and blocked callers resume in arrival order.
//!
//! The writer stages each change, publishes it to the pending cache, and lets the
//! owner write files through [`StoreHooks::post_store`]. Staged changes reach sled only
//! on commit, which happens when `flush_threshold` writes are pending, when the flush
//! timer fires, on an explicit commit request, or on close.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use super::backend::IndexBackend;
use super::document::IndexedDoc;
use super::proxy::{PendingCache, PendingEntry};
use super::{IndexError, IndexResult};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::storage::PropertyMeta;

/// Writer settings.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    /// Capacity of the queue.
    pub queue_size: usize,

    /// Pending writes that trigger a commit.
    pub flush_threshold: usize,

    /// Commit pending writes after this long; zero disables the timer.
    pub flush_timeout: Duration,

    /// Language given to plain strings of localized properties.
    pub default_language: String,
}

/// Kind of a store request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Create,
    Update,
    /// Incoming sync diff; `touch` assigns a local seqno to accepted properties.
    Merge { touch: bool },
    /// Tag the document `deleted`; the current layers are read on the writer.
    SoftDelete,
    /// Re-index what is already on disk.
    Populate,
}

/// One document write travelling through the queue.
#[derive(Clone, Debug)]
pub struct StoreOp {
    pub guid: String,

    /// Properties to write. `pre_store` stamps local writes and drops losing merges.
    pub props: BTreeMap<String, PropertyMeta>,

    pub kind: StoreKind,

    /// BLOB payloads of merged properties, written by `post_store` only for the
    /// properties `pre_store` keeps.
    pub blobs: BTreeMap<String, Vec<u8>>,

    /// Whether the document existed before this write; set by `pre_store`.
    pub existed: bool,
}

impl StoreOp {
    pub fn new(guid: impl Into<String>, kind: StoreKind) -> Self {
        Self {
            guid: guid.into(),
            props: BTreeMap::new(),
            kind,
            blobs: BTreeMap::new(),
            existed: false,
        }
    }
}

/// Callbacks the owner of the index supplies to the writer.
///
/// All of them run on the writer thread, after the item is dequeued.
pub trait StoreHooks: Send + Sync + 'static {
    /// Completes `op` and returns the full property values to index, or `None` when
    /// nothing is left to write.
    fn pre_store(&self, op: &mut StoreOp) -> Result<Option<BTreeMap<String, serde_json::Value>>>;

    /// Persists the accepted write and announces it.
    fn post_store(&self, op: &StoreOp, doc: &IndexedDoc) -> Result<()>;

    /// Removes a document's files and announces it.
    fn post_delete(&self, guid: &str) -> Result<()>;

    /// Called after every commit with the resource's commit counter.
    fn on_commit(&self, _commit: u64) {}

    /// Called once when the writer can no longer make progress.
    fn on_fatal(&self, _error: &IndexError) {}
}

/// Result of [`IndexWriter::put_wait`].
#[derive(Debug, PartialEq, Eq)]
pub enum PutWait<R> {
    /// Nothing changed since the caller's checkpoint.
    NoPut { last_commit: u64 },
    /// The closure ran on the writer after pending writes were committed.
    Done(R),
}

type WaitFn = Box<dyn FnOnce(&IndexBackend) + Send>;

enum Item {
    Store {
        op: StoreOp,
        reply: oneshot::Sender<Result<bool>>,
    },
    Delete {
        guid: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Commit {
        reply: oneshot::Sender<Result<u64>>,
    },
    Wait {
        run: WaitFn,
    },
    Close,
}

struct Queued {
    seqno: u64,
    item: Item,
    permit: Option<OwnedSemaphorePermit>,
}

/// Handle to a resource's writer thread.
pub struct IndexWriter {
    /// Resource name, for logs
    resource: String,

    /// Queue into the writer thread
    tx: Sender<Queued>,

    /// Free queue slots
    slots: Arc<Semaphore>,

    /// Last assigned queue seqno
    counter: Mutex<u64>,

    /// Queue seqno of the last enqueued write
    last_write: AtomicU64,

    /// Queue seqno of the last write covered by a commit
    committed: Arc<AtomicU64>,

    alive: Arc<AtomicBool>,

    commits: watch::Receiver<u64>,

    /// Signalled when the thread exits
    exited: Mutex<Option<oneshot::Receiver<()>>>,

    closing: AtomicBool,
}

impl IndexWriter {
    /// Starts the writer thread.
    pub fn spawn(
        resource: impl Into<String>,
        backend: Arc<IndexBackend>,
        metadata: Arc<Metadata>,
        pending: PendingCache,
        hooks: Arc<dyn StoreHooks>,
        config: WriterConfig,
    ) -> IndexResult<Self> {
        let resource = resource.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        let (commit_tx, commits) = watch::channel(0u64);
        let (exit_tx, exited) = oneshot::channel();
        let committed = Arc::new(AtomicU64::new(0));
        let alive = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            resource: resource.clone(),
            rx,
            backend,
            metadata,
            pending,
            hooks: hooks.clone(),
            config: config.clone(),
            staged: BTreeMap::new(),
            pending_writes: 0,
            processed: 0,
            deadline: None,
            commit_count: 0,
            commit_tx,
            committed: committed.clone(),
        };

        let thread_alive = alive.clone();
        let thread_resource = resource.clone();
        thread::Builder::new()
            .name(format!("index-{}", resource))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run()));
                thread_alive.store(false, Ordering::SeqCst);
                match outcome {
                    Ok(Ok(())) => debug!(resource = %thread_resource, "Index writer exited"),
                    Ok(Err(e)) => {
                        error!(resource = %thread_resource, "Index writer failed: {}", e);
                        hooks.on_fatal(&e);
                    }
                    Err(_) => {
                        error!(resource = %thread_resource, "Index writer panicked");
                        hooks.on_fatal(&IndexError::WriterDied);
                    }
                }
                let _ = exit_tx.send(());
            })?;

        info!(
            resource = %resource,
            queue_size = config.queue_size,
            flush_threshold = config.flush_threshold,
            flush_timeout_ms = config.flush_timeout.as_millis() as u64,
            "Index writer started"
        );

        Ok(Self {
            resource,
            tx,
            slots: Arc::new(Semaphore::new(config.queue_size.max(1))),
            counter: Mutex::new(0),
            last_write: AtomicU64::new(0),
            committed,
            alive,
            commits,
            exited: Mutex::new(Some(exited)),
            closing: AtomicBool::new(false),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Watch over the commit counter.
    pub fn commits(&self) -> watch::Receiver<u64> {
        self.commits.clone()
    }

    pub fn commit_count(&self) -> u64 {
        *self.commits.borrow()
    }

    /// Whether enqueued writes are still waiting for a commit.
    pub fn has_pending(&self) -> bool {
        self.last_write.load(Ordering::SeqCst) > self.committed.load(Ordering::SeqCst)
    }

    /// Enqueues a document write and waits until the writer has processed it.
    ///
    /// Returns `false` when `pre_store` found nothing to write.
    pub async fn store(&self, op: StoreOp) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.put(Item::Store { op, reply }).await?;
        rx.await.map_err(|_| Error::WriterDied)?
    }

    /// Enqueues a document removal and waits until it is processed.
    pub async fn delete(&self, guid: impl Into<String>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.put(Item::Delete {
            guid: guid.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::WriterDied)?
    }

    /// Enqueues a commit request and waits until it has been processed.
    pub async fn commit_and_wait(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.put(Item::Commit { reply }).await?;
        rx.await.map_err(|_| Error::WriterDied)?
    }

    /// Runs `f` on the writer once everything enqueued before it is committed.
    ///
    /// When no write is pending and no commit happened since `checkpoint`, returns
    /// [`PutWait::NoPut`] without touching the queue.
    pub async fn put_wait<R, F>(&self, checkpoint: u64, f: F) -> Result<PutWait<R>>
    where
        F: FnOnce(&IndexBackend) -> R + Send + 'static,
        R: Send + 'static,
    {
        let last_commit = self.commit_count();
        if !self.has_pending() && last_commit == checkpoint {
            return Ok(PutWait::NoPut { last_commit });
        }

        let (tx, rx) = oneshot::channel();
        let run: WaitFn = Box::new(move |backend| {
            let _ = tx.send(f(backend));
        });
        self.put(Item::Wait { run }).await?;
        rx.await.map(PutWait::Done).map_err(|_| Error::WriterDied)
    }

    /// Drains the queue, commits once and stops the thread.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_alive() {
            // A dead writer has nothing left to drain.
            let _ = self.put(Item::Close).await;
        }
        let exited = self.exited.lock().take();
        if let Some(exited) = exited {
            let _ = exited.await;
        }
        info!(resource = %self.resource, "Index writer closed");
        Ok(())
    }

    async fn put(&self, item: Item) -> Result<u64> {
        if !self.is_alive() {
            return Err(Error::WriterDied);
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::WriterDied)?;

        let is_write = matches!(item, Item::Store { .. } | Item::Delete { .. });
        let mut counter = self.counter.lock();
        *counter += 1;
        let seqno = *counter;
        if is_write {
            self.last_write.store(seqno, Ordering::SeqCst);
        }
        self.tx
            .send(Queued {
                seqno,
                item,
                permit: Some(permit),
            })
            .map_err(|_| Error::WriterDied)?;
        Ok(seqno)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Queued {
                seqno: 0,
                item: Item::Close,
                permit: None,
            });
        }
    }
}

struct Worker {
    resource: String,
    rx: Receiver<Queued>,
    backend: Arc<IndexBackend>,
    metadata: Arc<Metadata>,
    pending: PendingCache,
    hooks: Arc<dyn StoreHooks>,
    config: WriterConfig,

    /// Changes not yet applied to sled
    staged: BTreeMap<String, Option<IndexedDoc>>,
    pending_writes: usize,

    /// Queue seqno of the last processed write
    processed: u64,
    deadline: Option<Instant>,
    commit_count: u64,
    commit_tx: watch::Sender<u64>,
    committed: Arc<AtomicU64>,
}

impl Worker {
    fn run(mut self) -> IndexResult<()> {
        loop {
            let received = match self.deadline {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        Err(RecvTimeoutError::Timeout)
                    } else {
                        self.rx.recv_timeout(at - now)
                    }
                }
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            let Queued {
                seqno,
                item,
                permit,
            } = match received {
                Ok(queued) => queued,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(resource = %self.resource, "Flush timer fired");
                    self.commit()?;
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.commit_if_pending()?;
                    return Ok(());
                }
            };
            drop(permit);

            match item {
                Item::Store { op, reply } => {
                    let result = self.process_store(seqno, op);
                    let _ = reply.send(result);
                    self.commit_on_threshold()?;
                }
                Item::Delete { guid, reply } => {
                    let result = self.process_delete(seqno, &guid);
                    let _ = reply.send(result);
                    self.commit_on_threshold()?;
                }
                Item::Commit { reply } => {
                    self.commit_if_pending()?;
                    let _ = reply.send(Ok(self.commit_count));
                }
                Item::Wait { run } => {
                    self.commit_if_pending()?;
                    run(&self.backend);
                }
                Item::Close => {
                    self.commit_if_pending()?;
                    return Ok(());
                }
            }
        }
    }

    fn process_store(&mut self, seqno: u64, mut op: StoreOp) -> Result<bool> {
        let result = self.stage_store(seqno, &mut op);
        self.mark_processed(seqno);
        result
    }

    fn stage_store(&mut self, seqno: u64, op: &mut StoreOp) -> Result<bool> {
        let Some(values) = self.hooks.pre_store(op)? else {
            debug!(resource = %self.resource, guid = %op.guid, "Nothing to store");
            return Ok(false);
        };

        let doc = IndexedDoc::build(
            &self.metadata,
            &op.guid,
            &values,
            &self.config.default_language,
        );
        let previous = self.stage(seqno, &op.guid, Some(doc.clone()))?;

        if let Err(e) = self.hooks.post_store(op, &doc) {
            self.revert(&op.guid, previous);
            return Err(e);
        }

        self.note_write();
        debug!(resource = %self.resource, guid = %op.guid, seqno, "Staged store");
        Ok(true)
    }

    fn process_delete(&mut self, seqno: u64, guid: &str) -> Result<bool> {
        let result = self.stage_delete(seqno, guid);
        self.mark_processed(seqno);
        result
    }

    fn stage_delete(&mut self, seqno: u64, guid: &str) -> Result<bool> {
        let previous = self.stage(seqno, guid, None)?;
        if let Err(e) = self.hooks.post_delete(guid) {
            self.revert(guid, previous);
            return Err(e);
        }
        self.note_write();
        debug!(resource = %self.resource, guid = %guid, seqno, "Staged delete");
        Ok(true)
    }

    fn stage(
        &mut self,
        seqno: u64,
        guid: &str,
        post: Option<IndexedDoc>,
    ) -> Result<(Option<Option<IndexedDoc>>, Option<PendingEntry>)> {
        let mut cache = self.pending.write();
        let pre = match cache.get(guid) {
            Some(entry) => entry.pre.clone(),
            None => self.backend.get(guid)?,
        };
        let previous_entry = cache.insert(
            guid.to_string(),
            PendingEntry {
                seqno,
                pre,
                post: post.clone(),
            },
        );
        let previous_staged = self.staged.insert(guid.to_string(), post);
        Ok((previous_staged, previous_entry))
    }

    fn revert(&mut self, guid: &str, previous: (Option<Option<IndexedDoc>>, Option<PendingEntry>)) {
        let (staged, entry) = previous;
        match staged {
            Some(change) => {
                self.staged.insert(guid.to_string(), change);
            }
            None => {
                self.staged.remove(guid);
            }
        }
        let mut cache = self.pending.write();
        match entry {
            Some(entry) => {
                cache.insert(guid.to_string(), entry);
            }
            None => {
                cache.remove(guid);
            }
        }
    }

    fn note_write(&mut self) {
        self.pending_writes += 1;
        if self.deadline.is_none() && !self.config.flush_timeout.is_zero() {
            self.deadline = Some(Instant::now() + self.config.flush_timeout);
        }
    }

    fn mark_processed(&mut self, seqno: u64) {
        self.processed = seqno;
        if self.pending_writes == 0 {
            self.committed.store(seqno, Ordering::SeqCst);
        }
    }

    fn commit_on_threshold(&mut self) -> IndexResult<()> {
        if self.pending_writes >= self.config.flush_threshold {
            self.commit()?;
        }
        Ok(())
    }

    fn commit_if_pending(&mut self) -> IndexResult<()> {
        if self.pending_writes > 0 {
            self.commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> IndexResult<()> {
        let staged = std::mem::take(&mut self.staged);
        if let Err(e) = self.backend.apply(&staged).and_then(|_| self.backend.flush()) {
            error!(resource = %self.resource, "Index commit failed: {}", e);
            return Err(e);
        }

        {
            let mut cache = self.pending.write();
            let processed = self.processed;
            cache.retain(|guid, entry| !(staged.contains_key(guid) && entry.seqno <= processed));
        }

        self.commit_count += 1;
        self.committed.store(self.processed, Ordering::SeqCst);
        self.commit_tx.send_replace(self.commit_count);
        info!(
            resource = %self.resource,
            writes = self.pending_writes,
            commit = self.commit_count,
            "Committed index"
        );

        self.pending_writes = 0;
        self.deadline = None;
        self.hooks.on_commit(self.commit_count);
        Ok(())
    }
}
