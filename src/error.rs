//! Crate-wide error kinds.
//!
//! Every public operation of [`Directory`](crate::directory::Directory),
//! [`Volume`](crate::volume::Volume) and the sync layer returns [`Result`]. The
//! [`Router`](crate::router::Router) is the only place where an [`Error`] turns into a
//! transport status code, via [`Error::status`].

use thiserror::Error;

use crate::index::IndexError;
use crate::metadata::MetadataError;
use crate::storage::StorageError;
use crate::sync::SyncError;

/// Errors surfaced by the document store.
#[derive(Error, Debug)]
pub enum Error {
    /// Addressed document, property or BLOB does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Type coercion or enumeration check failed.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A document with the same guid already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Permission bit or access level check failed.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation requires an authenticated principal.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// BLOB is materialized as a URL.
    #[error("Redirect to {0}")]
    Redirect(String),

    /// Operation needs the online peer and none is connected.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// On-disk layout is older than the built-in version and could not be migrated.
    #[error("Layout mismatch: found version {found}, expected {expected}")]
    LayoutMismatch { found: u32, expected: u32 },

    /// The index writer thread is gone; the process cannot continue.
    #[error("Index writer died")]
    WriterDied,

    /// No room left in the outbound packet.
    #[error("Packet is full after {written} bytes")]
    DiskFull { written: u64 },

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Status code reported by the command router.
    pub fn status(&self) -> u16 {
        match self {
            Error::Redirect(_) => 303,
            Error::InvalidValue(_) | Error::Conflict(_) => 400,
            Error::Metadata(MetadataError::InvalidValue { .. })
            | Error::Metadata(MetadataError::UnknownProperty(_)) => 400,
            Error::Unauthorized(_) => 401,
            Error::PermissionDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::Storage(StorageError::NotFound(_)) => 404,
            _ => 500,
        }
    }

    /// Whether the caller can carry on after this error.
    ///
    /// Writer death, failed migrations and unrecoverable index corruption are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WriterDied
                | Error::LayoutMismatch { .. }
                | Error::Index(IndexError::Corrupted(_))
                | Error::Index(IndexError::WriterDied)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NotFound("x".into()).status(), 404);
        assert_eq!(Error::InvalidValue("x".into()).status(), 400);
        assert_eq!(Error::Conflict("x".into()).status(), 400);
        assert_eq!(Error::PermissionDenied("x".into()).status(), 403);
        assert_eq!(Error::Unauthorized("x".into()).status(), 401);
        assert_eq!(Error::Redirect("http://x".into()).status(), 303);
        assert_eq!(Error::WriterDied.status(), 500);
        assert_eq!(
            Error::Storage(StorageError::NotFound("g".into())).status(),
            404
        );
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(Error::WriterDied.is_fatal());
        assert!(Error::LayoutMismatch { found: 1, expected: 3 }.is_fatal());
        assert!(!Error::NotFound("x".into()).is_fatal());
        assert!(!Error::DiskFull { written: 10 }.is_fatal());
    }
}
