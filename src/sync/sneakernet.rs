//! Offline exchange through packet files in a shared directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::packet::{EntryMeta, NextVolume, PacketHeader, PacketReader, PacketWriter, EXTENSION};
use super::{blob_payloads, Sequence, SyncRecord, SyncState};
use crate::directory::{join_error, DiffRecord};
use crate::error::{Error, Result};
use crate::volume::Volume;

const PACKET_KIND: &str = "diff";

/// What one exchange step did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Packets read from the shared directory.
    pub packets: usize,

    /// Documents that accepted at least one incoming property.
    pub merged: usize,

    /// Documents written to the outbound packet.
    pub exported: usize,

    /// Outbound packet, when one was written.
    pub path: Option<PathBuf>,

    /// Seqnos the outbound packet commits.
    pub committed: Sequence,
}

/// Imports every packet in `dir` addressed to this node.
///
/// Acks shrink `to_send`, diffs are merged, commits shrink `to_receive`. Both
/// sequences are persisted at the end. Packets from a node other than the paired one
/// are skipped.
pub async fn import(volume: &Volume, state: &mut SyncState, dir: &Path) -> Result<ExchangeStats> {
    let node = volume.config().node_id.clone();
    let mut stats = ExchangeStats::default();

    for path in packet_files(dir)? {
        let source = path.clone();
        let packet = tokio::task::spawn_blocking(move || PacketReader::open(&source))
            .await
            .map_err(join_error)?;
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!(path = %path.display(), "Skipping unreadable packet: {}", e);
                continue;
            }
        };
        if !packet.header.is_for(&node) {
            continue;
        }
        if let Err(e) = state.bind(&packet.header.sender) {
            warn!(path = %path.display(), "Skipping packet: {}", e);
            continue;
        }

        let mut blobs = packet.blobs();
        for record in packet.records()? {
            match record {
                SyncRecord::Ack { sequence } => state.acked(&sequence),
                SyncRecord::Commit { sequence } => state.received(&sequence),
                SyncRecord::Diff {
                    resource,
                    guid,
                    diff,
                } => {
                    let directory = match volume.directory(&resource) {
                        Ok(directory) => directory,
                        Err(_) => {
                            warn!(resource = %resource, "Skipping diff for unknown resource");
                            continue;
                        }
                    };
                    let payloads: BTreeMap<String, Vec<u8>> = diff
                        .keys()
                        .filter_map(|prop| {
                            blobs
                                .remove(&(resource.clone(), guid.clone(), prop.clone()))
                                .map(|data| (prop.clone(), data))
                        })
                        .collect();
                    if directory.merge(&guid, diff, payloads, false).await? {
                        stats.merged += 1;
                    }
                }
            }
        }

        stats.packets += 1;
        debug!(path = %path.display(), sender = %packet.header.sender, "Imported packet");
    }

    state.commit()?;
    if stats.packets > 0 {
        info!(packets = stats.packets, merged = stats.merged, "Sneakernet import finished");
    }
    Ok(stats)
}

/// Writes one outbound packet into `dir`: an ack of what was received, then the local
/// changes still in `to_send`, then a commit naming the span actually written.
/// Without an explicit `receiver` the packet is addressed to the paired node, or to
/// everybody before the first exchange.
///
/// When the packet fills up it is still closed cleanly and [`Error::DiskFull`] is
/// returned; the next export resumes after the committed span.
pub async fn export(
    volume: &Volume,
    state: &mut SyncState,
    dir: &Path,
    receiver: Option<String>,
    next_volume: Option<NextVolume>,
) -> Result<ExchangeStats> {
    let config = volume.config();
    let receiver = match receiver {
        Some(receiver) => {
            state.bind(&receiver)?;
            Some(receiver)
        }
        None => state.peer().map(str::to_string),
    };
    fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "{}.{}",
        uuid::Uuid::new_v4().simple(),
        EXTENSION
    ));
    let header = PacketHeader::new(PACKET_KIND, &config.node_id).receiver(receiver);
    let mut writer =
        PacketWriter::create(&path, &header, config.packet_limit, config.packet_reserve)?;
    if let Some(hook) = next_volume {
        writer = writer.with_next_volume(hook);
    }

    let mut stats = ExchangeStats {
        path: Some(path.clone()),
        ..Default::default()
    };
    writer.push_trailer(&[SyncRecord::Ack {
        sequence: state.ack(),
    }])?;

    let to_send: Sequence = (*state.to_send).clone();
    let started = volume.seqno();
    let mut pending: Vec<(String, DiffRecord)> = Vec::new();
    for directory in volume.directories() {
        let diff = directory.diff(&to_send).await?;
        pending.extend(
            diff.records
                .into_iter()
                .map(|record| (directory.name().to_string(), record)),
        );
    }

    let mut full = None;
    let mut unsent_from = None;
    for (index, (resource, record)) in pending.iter().enumerate() {
        match write_record(volume, &mut writer, resource, record).await {
            Ok(()) => stats.exported += 1,
            Err(Error::DiskFull { written }) => {
                full = Some(written);
                unsent_from = pending[index..]
                    .iter()
                    .flat_map(|(_, record)| record.diff.values().map(|meta| meta.seqno))
                    .min();
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let upper = match unsent_from {
        Some(seqno) => started.min(seqno.saturating_sub(1)),
        None => started,
    };
    let committed = if upper == 0 {
        Sequence::new()
    } else {
        to_send.intersection(&Sequence::from(vec![(1, Some(upper))]))
    };
    if !committed.is_empty() {
        writer.push_trailer(&[SyncRecord::Commit {
            sequence: committed.clone(),
        }])?;
    }
    let written = writer.finish()?;
    stats.committed = committed;

    state.commit()?;
    info!(
        path = %path.display(),
        documents = stats.exported,
        committed = %stats.committed,
        bytes = written,
        "Sneakernet export finished"
    );

    match full {
        Some(written) => {
            warn!(path = %path.display(), documents = pending.len() - stats.exported, "Packet is full");
            Err(Error::DiskFull { written })
        }
        None => Ok(stats),
    }
}

/// Imports pending packets, then writes a fresh one.
pub async fn exchange(volume: &Volume, dir: &Path) -> Result<ExchangeStats> {
    let mut state = SyncState::open(volume.root())?;
    let imported = import(volume, &mut state, dir).await?;
    let exported = export(volume, &mut state, dir, None, None).await?;
    Ok(ExchangeStats {
        packets: imported.packets,
        merged: imported.merged,
        ..exported
    })
}

/// Writes the BLOB payloads of a record, then the record itself.
async fn write_record(
    volume: &Volume,
    writer: &mut PacketWriter,
    resource: &str,
    record: &DiffRecord,
) -> Result<()> {
    let directory = volume.directory(resource)?;
    for payload in blob_payloads(directory, record).await? {
        let entry = EntryMeta::Blob {
            resource: resource.to_string(),
            guid: record.guid.clone(),
            prop: payload.prop,
            digest: payload.blob.digest,
            size: payload.blob.size,
            mime_type: payload.blob.mime_type,
            mtime: payload.mtime,
        };
        writer.push_blob(&entry, &payload.data)?;
    }

    writer.push_messages(
        Some(resource),
        &[SyncRecord::Diff {
            resource: resource.to_string(),
            guid: record.guid.clone(),
            diff: record.diff.clone(),
        }],
    )
}

fn packet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == EXTENSION))
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::{Metadata, PropertyDescriptor, Typecast};
    use serde_json::json;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resources() -> Vec<Metadata> {
        vec![Metadata::new(
            "context",
            vec![
                PropertyDescriptor::new("title", Typecast::Str)
                    .slot(10)
                    .prefix("T")
                    .full_text(),
                PropertyDescriptor::blob("icon", "image/png"),
            ],
        )
        .unwrap()]
    }

    fn open(dir: &Path, node: &str) -> Volume {
        let config = Config::new(dir)
            .with_flush(100, Duration::ZERO)
            .with_node_id(node);
        Volume::open(config, resources()).unwrap()
    }

    fn props(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_export_import_with_blob() {
        let temp_dir = TempDir::new().unwrap();
        let shared = temp_dir.path().join("shared");
        let a = open(&temp_dir.path().join("a"), "a");
        let b = open(&temp_dir.path().join("b"), "b");

        let context = a.directory("context").unwrap();
        let guid = context.create(props(json!({"title": "hello"}))).await.unwrap();
        context
            .set_blob(&guid, "icon", Cursor::new(b"png".to_vec()), None)
            .await
            .unwrap();

        let stats = exchange(&a, &shared).await.unwrap();
        assert_eq!(stats.exported, 1);
        assert_eq!(stats.committed.ranges(), &[(1, Some(2))]);

        let stats = exchange(&b, &shared).await.unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.merged, 1);

        let copy = b.directory("context").unwrap();
        let original = context.get(&guid).unwrap().properties().unwrap();
        assert_eq!(copy.get(&guid).unwrap().properties().unwrap(), original);
        assert_eq!(copy.get_blob(&guid, "icon").await.unwrap().data, b"png");

        // B acknowledged A's commit.
        let mut state = SyncState::open(a.root()).unwrap();
        import(&a, &mut state, &shared).await.unwrap();
        assert_eq!(state.to_send.ranges(), &[(3, None)]);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_packets_from_unpaired_node_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let shared = temp_dir.path().join("shared");
        let a = open(&temp_dir.path().join("a"), "a");
        let b = open(&temp_dir.path().join("b"), "b");
        let c = open(&temp_dir.path().join("c"), "c");

        let mut state_a = SyncState::open(a.root()).unwrap();
        let mut state_b = SyncState::open(b.root()).unwrap();
        export(&a, &mut state_a, &shared, Some("b".into()), None).await.unwrap();
        import(&b, &mut state_b, &shared).await.unwrap();
        assert_eq!(state_b.peer(), Some("a"));

        // Addressed to the paired node without naming it.
        let stats = export(&b, &mut state_b, &shared, None, None).await.unwrap();
        let packet = PacketReader::open(stats.path.as_ref().unwrap()).unwrap();
        assert_eq!(packet.header.receiver.as_deref(), Some("a"));
        import(&a, &mut state_a, &shared).await.unwrap();

        let context = c.directory("context").unwrap();
        let guid = context.create(props(json!({"title": "from c"}))).await.unwrap();
        let mut state_c = SyncState::open(c.root()).unwrap();
        export(&c, &mut state_c, &shared, Some("a".into()), None).await.unwrap();

        let stats = import(&a, &mut state_a, &shared).await.unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.merged, 0);
        assert!(a.directory("context").unwrap().get(&guid).is_err());
        assert_eq!(state_a.peer(), Some("b"));

        a.close().await.unwrap();
        b.close().await.unwrap();
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_packet_resumes() {
        let temp_dir = TempDir::new().unwrap();
        let shared = temp_dir.path().join("shared");
        let root = temp_dir.path().join("a");
        let config = Config {
            packet_limit: 24 * 512,
            packet_reserve: 8 * 512,
            ..Config::new(&root)
                .with_flush(100, Duration::ZERO)
                .with_node_id("a")
        };
        let a = Volume::open(config, resources()).unwrap();
        let context = a.directory("context").unwrap();
        for i in 0..5 {
            context
                .create(props(json!({"title": format!("t{}", i)})))
                .await
                .unwrap();
        }

        let mut state = SyncState::open(a.root()).unwrap();
        let result = export(&a, &mut state, &shared, None, None).await;
        assert!(matches!(result, Err(Error::DiskFull { .. })));

        let packets = packet_files(&shared).unwrap();
        assert_eq!(packets.len(), 1);
        let packet = PacketReader::open(&packets[0]).unwrap();
        let records = packet.records().unwrap();
        let diffs = records
            .iter()
            .filter(|r| matches!(r, SyncRecord::Diff { .. }))
            .count();
        assert!(diffs > 0 && diffs < 5);
        match records.last() {
            Some(SyncRecord::Commit { sequence }) => {
                assert_eq!(sequence.ranges(), &[(1, Some(diffs as u64))])
            }
            other => panic!("unexpected {:?}", other),
        }
        a.close().await.unwrap();
    }
}
