//! On-disk document storage.
//!
//! Every resource owns one storage tree. Each document lives in its own directory,
//! `<guid[:2]>/<guid>/`, with one JSON [`PropertyMeta`] file per property, a sibling
//! `<prop>.blob` for BLOB payloads, a `<prop>/` directory of flag files for aggregated
//! properties, and a zero-length `.document` marker.
//!
//! The storage guarantees:
//! - Every file write goes through a temporary file in the same directory followed by a
//!   rename, so a crash leaves either the old or the new content
//! - The document directory's mtime is bumped after every successful write, which lets
//!   [`Storage::walk`] find documents touched after the last index commit
//! - The layout version at the volume root is migrated forward before any index opens

pub mod fs;
pub mod migration;
pub mod record;

pub use fs::Storage;
pub use migration::{migrate, read_layout, write_layout, LAYOUT_VERSION};
pub use record::{PropertyMeta, Record};

use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Corrupted file: {0}")]
    Corrupted(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
