//! Index engine and write pipeline.
//!
//! Each resource has one sled-backed committed index ([`IndexBackend`]), one writer
//! thread that is its only mutator ([`IndexWriter`]), and any number of readers going
//! through an [`IndexProxy`]:
//!
//! 1. **Writer**: drains a bounded FIFO, stages each change, and applies the staged
//!    batch to sled on commit (threshold, timer, explicit request or close)
//! 2. **Pending cache**: staged but uncommitted changes, shared with readers so they see
//!    their own writes before the commit lands
//! 3. **Proxy**: evaluates a query against the committed index, patches the result with
//!    the pending cache, then sorts, groups and pages it

pub mod backend;
pub mod document;
pub mod proxy;
pub mod query;
pub mod writer;

pub use backend::IndexBackend;
pub use document::{IndexedDoc, SortKey};
pub use proxy::{new_pending_cache, FindResult, Hit, IndexProxy, PendingCache, PendingEffect, PendingEntry};
pub use query::{FindRequest, Query};
pub use writer::{IndexWriter, PutWait, StoreHooks, StoreKind, StoreOp, WriterConfig};

use thiserror::Error;

/// Index errors.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Index is corrupted: {0}")]
    Corrupted(String),

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Index writer died")]
    WriterDied,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;
