//! Online sync over a long-lived byte stream.
//!
//! Peers speak newline-delimited JSON. After `hello` each side announces with `pull`
//! the seqnos it still wants. Local commits push `changeset` messages for whatever the
//! peer wants and has not been sent in this session; BLOB payloads go ahead of their
//! changeset as a `blob` line followed by the raw bytes. Every `sync_interval` a side
//! sends `sync` carrying its ack, and the peer answers with its own `ack`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{blob_payloads, Sequence, SyncError, SyncRecord, SyncState};
use crate::error::{Error, Result};
use crate::volume::{EventFilter, EventKind, Volume};

/// Messages exchanged during a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello { node: String },

    /// Seqnos the sender still expects from its peer.
    Pull { sequence: Sequence },

    Changeset { records: Vec<SyncRecord> },

    /// Announces `size` raw bytes following the line.
    Blob {
        resource: String,
        guid: String,
        prop: String,
        size: u64,
    },

    /// Periodic ack from the initiating side of a round.
    Sync { ack: Sequence },

    /// Reply to `sync`.
    Ack { sequence: Sequence },
}

struct Incoming {
    message: Message,
    payload: Option<Vec<u8>>,
}

/// Counters of one session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub peer: String,

    /// Diff records pushed to the peer.
    pub pushed: usize,

    /// Documents that accepted incoming properties.
    pub merged: usize,
}

/// Opens byte streams to the peer.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> std::io::Result<Self::Stream>;
}

/// Dials a TCP address.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Online replication of one volume with its peer.
pub struct OnlineSync {
    volume: Arc<Volume>,
    state: Mutex<SyncState>,

    /// Sessions past the handshake right now
    online: AtomicUsize,

    /// Sessions that ever got past the handshake
    established: AtomicU64,
}

impl OnlineSync {
    pub fn new(volume: Arc<Volume>) -> Result<Arc<Self>> {
        let state = SyncState::open(volume.root())?;
        Ok(Arc::new(Self {
            volume,
            state: Mutex::new(state),
            online: AtomicUsize::new(0),
            established: AtomicU64::new(0),
        }))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst) > 0
    }

    /// Fails with [`Error::ServiceUnavailable`] when no peer is connected.
    pub fn require_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::ServiceUnavailable("no online peer".to_string()))
        }
    }

    /// Seqnos still waiting for the peer's ack.
    pub fn to_send(&self) -> Sequence {
        (*self.state.lock().to_send).clone()
    }

    /// Seqnos still expected from the peer.
    pub fn to_receive(&self) -> Sequence {
        (*self.state.lock().to_receive).clone()
    }

    /// Keeps dialing the peer until `shutdown` flips, backing off between attempts.
    pub async fn run<C: Connector>(&self, connector: &C, mut shutdown: watch::Receiver<bool>) {
        let config = self.volume.config().clone();
        let mut backoff = build_backoff(config.sync_backoff_min, config.sync_backoff_max);

        while !*shutdown.borrow() {
            let before = self.established.load(Ordering::SeqCst);
            let result = match connector.connect().await {
                Ok(stream) => self.session(stream, shutdown.clone()).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(stats) => info!(peer = %stats.peer, pushed = stats.pushed, merged = stats.merged, "Online sync session ended"),
                Err(e) if e.is_fatal() => {
                    warn!("Online sync stopped: {}", e);
                    return;
                }
                Err(e) => warn!("Online sync session failed: {}", e),
            }
            if self.established.load(Ordering::SeqCst) != before {
                backoff = build_backoff(config.sync_backoff_min, config.sync_backoff_max);
            }
            if *shutdown.borrow() {
                break;
            }

            let Some(delay) = backoff.next() else {
                break;
            };
            debug!(delay = ?delay, "Reconnecting to peer");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Runs one session over `stream` until the peer leaves or `shutdown` flips.
    pub async fn session<S>(&self, stream: S, mut shutdown: watch::Receiver<bool>) -> Result<SessionStats>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = self.volume.config().clone();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel(16);
        let reader = tokio::spawn(read_loop(
            read_half,
            config.sync_interval + config.sync_timeout,
            config.packet_limit,
            tx,
        ));

        let mut session = Session {
            sync: self,
            writer: &mut write_half,
            timeout: config.sync_timeout,
            stats: SessionStats::default(),
            peer_pull: None,
            pushed: Sequence::new(),
            blobs: BTreeMap::new(),
        };
        let result = session.drive(&mut rx, &mut shutdown).await;
        let stats = session.stats;
        reader.abort();

        if let Err(e) = self.state.lock().commit() {
            warn!("Cannot persist sync state: {}", e);
        }
        result.map(|()| stats)
    }
}

fn build_backoff(min: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBuilder::new()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_jitter()
        .without_max_times()
        .build()
}

struct Session<'a, W> {
    sync: &'a OnlineSync,
    writer: &'a mut W,
    timeout: Duration,
    stats: SessionStats,

    /// What the peer asked for; pushing starts once it is known
    peer_pull: Option<Sequence>,

    /// Spans committed to the peer during this session
    pushed: Sequence,

    /// Payloads waiting for their changeset
    blobs: BTreeMap<(String, String, String), Vec<u8>>,
}

impl<W: AsyncWrite + Unpin + Send> Session<'_, W> {
    async fn drive(
        &mut self,
        rx: &mut mpsc::Receiver<Result<Incoming>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let volume = self.sync.volume.clone();
        let config = volume.config().clone();

        let to_receive = self.sync.to_receive();
        self.send(&Message::Hello { node: config.node_id.clone() }, None).await?;
        self.send(&Message::Pull { sequence: to_receive }, None).await?;

        match next(rx).await? {
            Incoming {
                message: Message::Hello { node },
                ..
            } => {
                self.sync.state.lock().bind(&node)?;
                self.stats.peer = node;
            }
            other => {
                return Err(SyncError::Protocol(format!("expected hello, got {:?}", other.message)).into())
            }
        }
        info!(peer = %self.stats.peer, "Online sync session established");
        self.sync.established.fetch_add(1, Ordering::SeqCst);
        self.sync.online.fetch_add(1, Ordering::SeqCst);
        let result = self.serve(rx, shutdown, &volume, config.sync_interval).await;
        self.sync.online.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn serve(
        &mut self,
        rx: &mut mpsc::Receiver<Result<Incoming>>,
        shutdown: &mut watch::Receiver<bool>,
        volume: &Volume,
        interval: Duration,
    ) -> Result<()> {
        let mut commits = volume.subscribe(EventFilter::default().events(&[EventKind::Commit]));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                incoming = next(rx) => self.handle(incoming?, volume).await?,
                Some(_) = commits.recv() => self.push(volume).await?,
                _ = ticker.tick() => {
                    let ack = self.sync.state.lock().ack();
                    self.send(&Message::Sync { ack }, None).await?;
                }
            }
        }
    }

    async fn handle(&mut self, incoming: Incoming, volume: &Volume) -> Result<()> {
        match incoming.message {
            Message::Hello { node } => {
                warn!(peer = %node, "Ignoring repeated hello");
            }
            Message::Pull { sequence } => {
                debug!(peer = %self.stats.peer, sequence = %sequence, "Peer pull");
                self.peer_pull = Some(sequence);
                self.pushed = Sequence::new();
                self.push(volume).await?;
            }
            Message::Blob {
                resource,
                guid,
                prop,
                ..
            } => {
                let payload = incoming.payload.unwrap_or_default();
                self.blobs.insert((resource, guid, prop), payload);
            }
            Message::Changeset { records } => self.apply(records, volume).await?,
            Message::Sync { ack } => {
                let reply = {
                    let mut state = self.sync.state.lock();
                    state.acked(&ack);
                    state.commit()?;
                    state.ack()
                };
                self.send(&Message::Ack { sequence: reply }, None).await?;
            }
            Message::Ack { sequence } => {
                let mut state = self.sync.state.lock();
                state.acked(&sequence);
                state.commit()?;
            }
        }
        Ok(())
    }

    /// Sends changes the peer wants and this session has not committed yet.
    async fn push(&mut self, volume: &Volume) -> Result<()> {
        let Some(peer_pull) = self.peer_pull.as_ref() else {
            return Ok(());
        };
        let mut range = self.sync.to_send().intersection(peer_pull);
        range.exclude_all(&self.pushed);
        if range.is_empty() {
            return Ok(());
        }

        let started = volume.seqno();
        let mut records = Vec::new();
        for directory in volume.directories() {
            let diff = directory.diff(&range).await?;
            for record in diff.records {
                for payload in blob_payloads(directory, &record).await? {
                    let message = Message::Blob {
                        resource: directory.name().to_string(),
                        guid: record.guid.clone(),
                        prop: payload.prop,
                        size: payload.data.len() as u64,
                    };
                    self.send(&message, Some(&payload.data)).await?;
                }
                records.push(SyncRecord::Diff {
                    resource: directory.name().to_string(),
                    guid: record.guid,
                    diff: record.diff,
                });
            }
        }
        let diffs = records.len();

        let covered = if started == 0 {
            Sequence::new()
        } else {
            range.intersection(&Sequence::from(vec![(1, Some(started))]))
        };
        if !covered.is_empty() {
            records.push(SyncRecord::Commit {
                sequence: covered.clone(),
            });
        }
        if records.is_empty() {
            return Ok(());
        }

        self.send(&Message::Changeset { records }, None).await?;
        self.pushed.include_all(&covered);
        self.stats.pushed += diffs;
        debug!(peer = %self.stats.peer, documents = diffs, covered = %covered, "Pushed changeset");
        Ok(())
    }

    async fn apply(&mut self, records: Vec<SyncRecord>, volume: &Volume) -> Result<()> {
        for record in records {
            match record {
                SyncRecord::Diff {
                    resource,
                    guid,
                    diff,
                } => {
                    let Ok(directory) = volume.directory(&resource) else {
                        warn!(resource = %resource, "Skipping diff for unknown resource");
                        continue;
                    };
                    let payloads: BTreeMap<String, Vec<u8>> = diff
                        .keys()
                        .filter_map(|prop| {
                            self.blobs
                                .remove(&(resource.clone(), guid.clone(), prop.clone()))
                                .map(|data| (prop.clone(), data))
                        })
                        .collect();
                    if directory.merge(&guid, diff, payloads, false).await? {
                        self.stats.merged += 1;
                    }
                }
                SyncRecord::Commit { sequence } => {
                    self.sync.state.lock().received(&sequence);
                }
                SyncRecord::Ack { sequence } => {
                    self.sync.state.lock().acked(&sequence);
                }
            }
        }
        self.blobs.clear();
        self.sync.state.lock().commit()
    }

    async fn send(&mut self, message: &Message, payload: Option<&[u8]>) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let writer = &mut *self.writer;
        let write = async move {
            writer.write_all(&line).await?;
            if let Some(payload) = payload {
                writer.write_all(payload).await?;
            }
            writer.flush().await
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| SyncError::Timeout)??;
        Ok(())
    }
}

async fn next(rx: &mut mpsc::Receiver<Result<Incoming>>) -> Result<Incoming> {
    match rx.recv().await {
        Some(incoming) => incoming,
        None => Err(SyncError::Disconnected.into()),
    }
}

/// Reads messages off the stream and forwards them until EOF or an error.
async fn read_loop<R>(reader: R, timeout: Duration, max_blob: u64, tx: mpsc::Sender<Result<Incoming>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let result = read_message(&mut reader, timeout, max_blob).await;
        let done = result.is_err();
        if tx.send(result).await.is_err() || done {
            break;
        }
    }
}

async fn read_message<R>(reader: &mut BufReader<R>, timeout: Duration, max_blob: u64) -> Result<Incoming>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| SyncError::Timeout)??;
    if read == 0 {
        return Err(SyncError::Disconnected.into());
    }
    let message: Message = serde_json::from_str(line.trim_end())
        .map_err(|e| SyncError::Protocol(format!("bad message: {}", e)))?;

    let payload = match &message {
        Message::Blob { size, .. } => {
            if *size > max_blob {
                return Err(SyncError::Protocol(format!("blob of {} bytes is too large", size)).into());
            }
            let mut data = vec![0u8; *size as usize];
            tokio::time::timeout(timeout, reader.read_exact(&mut data))
                .await
                .map_err(|_| SyncError::Timeout)??;
            Some(data)
        }
        _ => None,
    };
    Ok(Incoming { message, payload })
}
