//! Sneakernet packet files.
//!
//! A packet is a gzip-compressed tar archive. The first entry, `header`, names the
//! sender and optionally the receiver. Every following payload entry `NNNNNNNN` is
//! preceded by its `NNNNNNNN.meta` descriptor: a `messages` payload holds
//! newline-delimited [`SyncRecord`]s, a `blob` payload holds raw bytes for one
//! document property.
//!
//! The writer accounts for the uncompressed tar size so the archive never outgrows
//! its limit, whatever the compression ratio.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{SyncError, SyncRecord};
use crate::error::{Error, Result};

pub const CONTENT_TYPE: &str = "application/x-sn-packet";
pub const SUBJECT: &str = "Sugar Network Packet";
pub const EXTENSION: &str = "packet";

const HEADER_ENTRY: &str = "header";
const META_SUFFIX: &str = ".meta";
const BLOCK: u64 = 512;

/// Packet header entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub subject: String,

    #[serde(rename = "type")]
    pub kind: String,

    /// Node id of the producer.
    pub sender: String,

    /// Node id the packet is meant for; `None` addresses everybody.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

impl PacketHeader {
    pub fn new(kind: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            subject: SUBJECT.to_string(),
            kind: kind.into(),
            sender: sender.into(),
            receiver: None,
        }
    }

    pub fn receiver(mut self, receiver: Option<String>) -> Self {
        self.receiver = receiver;
        self
    }

    /// Whether a node with id `node` should import this packet.
    pub fn is_for(&self, node: &str) -> bool {
        self.sender != node && self.receiver.as_deref().map_or(true, |r| r == node)
    }
}

/// Descriptor of one payload entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryMeta {
    Messages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
    },
    Blob {
        resource: String,
        guid: String,
        prop: String,
        digest: String,
        size: u64,
        mime_type: String,
        mtime: i64,
    },
}

/// One decoded payload with its descriptor.
#[derive(Clone, Debug)]
pub struct PacketEntry {
    pub meta: EntryMeta,
    pub payload: Vec<u8>,
}

/// A fully read packet.
#[derive(Clone, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    pub entries: Vec<PacketEntry>,
}

impl Packet {
    /// Every record of every `messages` entry, in archive order.
    pub fn records(&self) -> Result<Vec<SyncRecord>> {
        let mut records = Vec::new();
        for entry in &self.entries {
            if !matches!(entry.meta, EntryMeta::Messages { .. }) {
                continue;
            }
            for line in entry.payload.split(|b| *b == b'\n') {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let record = serde_json::from_slice(line)
                    .map_err(|e| SyncError::Packet(format!("bad record: {}", e)))?;
                records.push(record);
            }
        }
        Ok(records)
    }

    /// BLOB payloads keyed by `(resource, guid, prop)`.
    pub fn blobs(&self) -> BTreeMap<(String, String, String), Vec<u8>> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.meta {
                EntryMeta::Blob {
                    resource,
                    guid,
                    prop,
                    ..
                } => Some((
                    (resource.clone(), guid.clone(), prop.clone()),
                    entry.payload.clone(),
                )),
                EntryMeta::Messages { .. } => None,
            })
            .collect()
    }
}

/// Reads packet files.
pub struct PacketReader;

impl PacketReader {
    pub fn open(path: &Path) -> Result<Packet> {
        let file = File::open(path)?;
        Self::read(file)
    }

    pub fn read<R: Read>(input: R) -> Result<Packet> {
        let mut archive = tar::Archive::new(GzDecoder::new(input));
        let mut header = None;
        let mut metas: BTreeMap<String, EntryMeta> = BTreeMap::new();
        let mut payloads: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for entry in archive.entries().map_err(bad_archive)? {
            let mut entry = entry.map_err(bad_archive)?;
            let name = entry.path().map_err(bad_archive)?.to_string_lossy().into_owned();
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).map_err(bad_archive)?;

            if name == HEADER_ENTRY {
                let parsed: PacketHeader = serde_json::from_slice(&data)
                    .map_err(|e| SyncError::Packet(format!("bad header: {}", e)))?;
                header = Some(parsed);
            } else if let Some(stem) = name.strip_suffix(META_SUFFIX) {
                let meta = serde_json::from_slice(&data)
                    .map_err(|e| SyncError::Packet(format!("bad meta {}: {}", name, e)))?;
                metas.insert(stem.to_string(), meta);
            } else {
                payloads.insert(name, data);
            }
        }

        let header = header.ok_or_else(|| SyncError::Packet("missing header".to_string()))?;
        if header.subject != SUBJECT {
            return Err(SyncError::Packet(format!("unknown subject {:?}", header.subject)).into());
        }

        let mut entries = Vec::with_capacity(metas.len());
        for (name, meta) in metas {
            match payloads.remove(&name) {
                Some(payload) => entries.push(PacketEntry { meta, payload }),
                None => warn!(entry = %name, "Packet entry has no payload"),
            }
        }
        Ok(Packet { header, entries })
    }
}

fn bad_archive(e: std::io::Error) -> Error {
    SyncError::Packet(e.to_string()).into()
}

/// Grants extra bytes once the packet is full: called with the bytes written so far,
/// returns how many more may be written, or `None` to stop.
pub type NextVolume = Box<dyn FnMut(u64) -> Option<u64> + Send>;

/// Builds a packet file within a size budget.
pub struct PacketWriter {
    path: PathBuf,
    builder: tar::Builder<GzEncoder<BufWriter<File>>>,

    /// Uncompressed archive bytes so far
    written: u64,

    /// Bytes available to ordinary entries
    budget: u64,

    /// Bytes available to trailing records, including the reservation
    limit: u64,

    next_entry: u32,
    next_volume: Option<NextVolume>,
}

impl PacketWriter {
    /// Creates `path` and writes the header entry.
    pub fn create(path: impl Into<PathBuf>, header: &PacketHeader, limit: u64, reserve: u64) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut writer = Self {
            path,
            builder: tar::Builder::new(encoder),
            written: 0,
            budget: limit.saturating_sub(reserve),
            limit,
            next_entry: 0,
            next_volume: None,
        };
        let data = serde_json::to_vec(header)?;
        writer.append(HEADER_ENTRY, &data)?;
        debug!(path = %writer.path.display(), sender = %header.sender, "Started packet");
        Ok(writer)
    }

    pub fn with_next_volume(mut self, hook: NextVolume) -> Self {
        self.next_volume = Some(hook);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends a `messages` entry, failing with [`Error::DiskFull`] when it does not fit.
    pub fn push_messages(&mut self, resource: Option<&str>, records: &[SyncRecord]) -> Result<()> {
        let payload = encode_records(records)?;
        let meta = EntryMeta::Messages {
            resource: resource.map(str::to_string),
        };
        self.push(&meta, &payload, false)
    }

    /// Appends a `blob` entry.
    pub fn push_blob(&mut self, meta: &EntryMeta, payload: &[u8]) -> Result<()> {
        self.push(meta, payload, false)
    }

    /// Appends the trailing records; these may use the reservation.
    pub fn push_trailer(&mut self, records: &[SyncRecord]) -> Result<()> {
        let payload = encode_records(records)?;
        self.push(&EntryMeta::Messages { resource: None }, &payload, true)
    }

    /// Finishes the archive and returns the uncompressed size.
    pub fn finish(self) -> Result<u64> {
        let encoder = self.builder.into_inner()?;
        let file = encoder.finish()?;
        let file = file.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        info!(path = %self.path.display(), bytes = self.written, "Packet written");
        Ok(self.written)
    }

    fn push(&mut self, meta: &EntryMeta, payload: &[u8], trailer: bool) -> Result<()> {
        let meta_data = serde_json::to_vec(meta)?;
        let needed = entry_size(meta_data.len() as u64) + entry_size(payload.len() as u64);
        if !self.fits(needed, trailer) {
            return Err(Error::DiskFull {
                written: self.written,
            });
        }

        let name = format!("{:08}", self.next_entry);
        self.next_entry += 1;
        self.append(&format!("{}{}", name, META_SUFFIX), &meta_data)?;
        self.append(&name, payload)
    }

    fn fits(&mut self, needed: u64, trailer: bool) -> bool {
        let cap = if trailer { self.limit } else { self.budget };
        if self.written + needed <= cap {
            return true;
        }
        if trailer {
            return false;
        }
        let Some(hook) = self.next_volume.as_mut() else {
            return false;
        };
        match hook(self.written) {
            Some(extra) if self.written + needed <= self.budget + extra => {
                self.budget += extra;
                self.limit += extra;
                true
            }
            _ => false,
        }
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(crate::directory::now().max(0) as u64);
        self.builder.append_data(&mut header, name, data)?;
        self.written += entry_size(data.len() as u64);
        Ok(())
    }
}

/// Tar bytes taken by an entry: one header block plus padded data.
fn entry_size(len: u64) -> u64 {
    BLOCK + len.div_ceil(BLOCK) * BLOCK
}

fn encode_records(records: &[SyncRecord]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for record in records {
        serde_json::to_writer(&mut payload, record)?;
        payload.push(b'\n');
    }
    Ok(payload)
}
