//! # sndb: a replicated, schema-driven document store
//!
//! A node keeps typed collections of documents ("directories") in a volume on disk,
//! serves CRUD and search over them, and reconciles its copy with a peer, either over a
//! long-lived connection or by exchanging packet files. Every property carries its own
//! mtime and seqno so that edits made on disconnected peers merge deterministically.
//!
//! - **Metadata**: property descriptors, type coercion, permissions
//! - **Storage**: one directory per document, one file per property, BLOBs next to them
//! - **Index**: sled-backed term and slot index behind a single writer per resource
//! - **Directory / Volume**: the document API, a shared seqno and an event bus
//! - **Sync**: seqno ranges, diff and merge, sneakernet packets, online sessions
//!
//! # Usage
//!
//! ```bash
//! sndb --data-dir ./node serve --listen-sync-url tcp://0.0.0.0:5001
//! sndb --data-dir ./laptop export /media/usb
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod index;
pub mod metadata;
pub mod resources;
pub mod router;
pub mod server;
pub mod storage;
pub mod sync;
pub mod volume;

pub use config::Config;
pub use directory::{Directory, Document};
pub use error::{Error, Result};
pub use index::FindRequest;
pub use metadata::{Metadata, Permission, PropertyDescriptor, Typecast};
pub use router::{Request, Response, Router};
pub use server::{ServerConfig, SndbServer};
pub use storage::PropertyMeta;
pub use sync::{OnlineSync, Sequence};
pub use volume::{Event, EventFilter, EventKind, Volume};
