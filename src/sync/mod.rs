//! Replication between volumes.
//!
//! Both transports move the same records: per-document diffs produced by
//! [`Directory::diff`](crate::directory::Directory::diff), a `commit` naming the seqno
//! span a batch covers, and an `ack` naming what the receiver already holds. Each side
//! keeps two [`PersistentSequence`]s under `<root>/var`: what it still has to push and
//! what it still expects to pull.
//!
//! The sequences describe one counterpart. A volume is paired with the first node it
//! exchanges with (`var/peer`); packets and sessions from any other node are refused,
//! so topologies with more nodes are built as chains or stars of paired volumes.

pub mod online;
pub mod packet;
pub mod ranges;
pub mod sneakernet;

pub use online::{Connector, OnlineSync, SessionStats, TcpConnector};
pub use packet::{EntryMeta, Packet, PacketHeader, PacketReader, PacketWriter, CONTENT_TYPE};
pub use ranges::{PersistentSequence, Range, Sequence};
pub use sneakernet::{exchange, export, import, ExchangeStats};

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::directory::{join_error, DiffRecord, Directory};
use crate::error::Result;
use crate::metadata::BlobRef;
use crate::storage::fs::write_atomic;
use crate::storage::PropertyMeta;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Bad packet: {0}")]
    Packet(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Corrupted sequence: {0}")]
    Corrupted(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Timed out waiting for peer")]
    Timeout,

    #[error("Volume is paired with {paired}, refusing {node}")]
    ForeignPeer { paired: String, node: String },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// One record of a changeset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncRecord {
    /// Properties of one document that fall into the pushed range.
    Diff {
        resource: String,
        guid: String,
        diff: BTreeMap<String, PropertyMeta>,
    },

    /// The sender's seqno span covered by the records before it.
    Commit { sequence: Sequence },

    /// Seqnos the sender has received from the peer.
    Ack { sequence: Sequence },
}

const PUSH_SEQUENCE: &str = "var/push/sequence";
const PULL_SEQUENCE: &str = "var/pull/sequence";
const VAR_DIR: &str = "var";
const PEER_FILE: &str = "peer";

/// The two sequences a node keeps for its peer.
pub struct SyncState {
    /// Local seqnos not yet acknowledged by the peer.
    pub to_send: PersistentSequence,

    /// Peer seqnos not received yet.
    pub to_receive: PersistentSequence,

    /// Node the sequences belong to, once known
    peer: Option<String>,

    var_dir: PathBuf,
}

impl SyncState {
    pub fn open(root: &Path) -> Result<Self> {
        let var_dir = root.join(VAR_DIR);
        let peer = match fs::read_to_string(var_dir.join(PEER_FILE)) {
            Ok(peer) => Some(peer.trim().to_string()).filter(|peer| !peer.is_empty()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            to_send: PersistentSequence::open(root.join(PUSH_SEQUENCE), Sequence::from_start(1))?,
            to_receive: PersistentSequence::open(
                root.join(PULL_SEQUENCE),
                Sequence::from_start(1),
            )?,
            peer,
            var_dir,
        })
    }

    /// The paired node, if any exchange happened yet.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Pairs the volume with `node` on first contact; any other node is refused
    /// with [`SyncError::ForeignPeer`].
    pub fn bind(&mut self, node: &str) -> Result<()> {
        match &self.peer {
            Some(paired) if paired == node => Ok(()),
            Some(paired) => Err(SyncError::ForeignPeer {
                paired: paired.clone(),
                node: node.to_string(),
            }
            .into()),
            None => {
                fs::create_dir_all(&self.var_dir)?;
                write_atomic(&self.var_dir, PEER_FILE, node.as_bytes())?;
                info!(peer = %node, "Paired sync state with peer");
                self.peer = Some(node.to_string());
                Ok(())
            }
        }
    }

    /// What this node has received so far, sent to the peer as an ack.
    pub fn ack(&self) -> Sequence {
        self.to_receive.complement()
    }

    /// Applies a peer's ack.
    pub fn acked(&mut self, sequence: &Sequence) {
        self.to_send.exclude_all(sequence);
    }

    /// Applies a peer's commit.
    pub fn received(&mut self, sequence: &Sequence) {
        self.to_receive.exclude_all(sequence);
    }

    pub fn commit(&self) -> Result<()> {
        self.to_send.commit()?;
        self.to_receive.commit()
    }
}

/// A locally held BLOB payload referenced by a diff.
pub(crate) struct BlobPayload {
    pub prop: String,
    pub blob: BlobRef,
    pub mtime: i64,
    pub data: Vec<u8>,
}

/// Loads the payloads of the BLOB properties in `record`. URL-only BLOBs travel by
/// reference inside the diff and yield nothing here.
pub(crate) async fn blob_payloads(
    directory: &Directory,
    record: &DiffRecord,
) -> Result<Vec<BlobPayload>> {
    let mut payloads = Vec::new();
    for (prop, meta) in &record.diff {
        if !directory.metadata().get(prop).map_or(false, |desc| desc.blob) {
            continue;
        }
        let Ok(blob) = serde_json::from_value::<BlobRef>(meta.value.clone()) else {
            continue;
        };
        if blob.digest.is_empty() {
            continue;
        }
        let storage = directory.storage().clone();
        let (guid, name) = (record.guid.clone(), prop.clone());
        let data = tokio::task::spawn_blocking(move || storage.get_blob(&guid, &name))
            .await
            .map_err(join_error)??;
        if let Some(data) = data {
            payloads.push(BlobPayload {
                prop: prop.clone(),
                blob,
                mtime: meta.mtime,
                data,
            });
        }
    }
    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_record_wire_form() {
        let mut diff = BTreeMap::new();
        diff.insert("title".to_string(), PropertyMeta::new(json!("A"), 1, 3));
        let record = SyncRecord::Diff {
            resource: "context".into(),
            guid: "g".into(),
            diff,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "type": "diff",
                "resource": "context",
                "guid": "g",
                "diff": {"title": {"value": "A", "mtime": 1, "seqno": 3}}
            })
        );

        let commit: SyncRecord =
            serde_json::from_value(json!({"type": "commit", "sequence": [[1, 4]]})).unwrap();
        assert_eq!(
            commit,
            SyncRecord::Commit {
                sequence: Sequence::from(vec![(1, Some(4))])
            }
        );
    }

    #[test]
    fn test_state_bookkeeping() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = SyncState::open(temp_dir.path()).unwrap();
        assert!(state.ack().is_empty());

        state.received(&Sequence::from(vec![(1, Some(5))]));
        assert_eq!(state.ack().ranges(), &[(1, Some(5))]);

        state.acked(&Sequence::from(vec![(1, Some(3))]));
        assert_eq!(state.to_send.ranges(), &[(4, None)]);
        state.commit().unwrap();

        let reopened = SyncState::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.to_send.ranges(), &[(4, None)]);
        assert_eq!(reopened.to_receive.ranges(), &[(6, None)]);
    }

    #[test]
    fn test_state_pairs_with_one_peer() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = SyncState::open(temp_dir.path()).unwrap();
        assert_eq!(state.peer(), None);

        state.bind("b").unwrap();
        state.bind("b").unwrap();
        assert!(matches!(
            state.bind("c"),
            Err(crate::error::Error::Sync(SyncError::ForeignPeer { .. }))
        ));

        let reopened = SyncState::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.peer(), Some("b"));
    }
}
