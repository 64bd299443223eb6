//! Node orchestration.
//!
//! A node opens its volume, re-indexes whatever the last run left unindexed, then
//! serves online-sync peers over TCP and keeps dialing a configured upstream peer
//! until it is told to stop. The index writers are watched; losing one ends the run.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::router::Router;
use crate::sync::{OnlineSync, TcpConnector};
use crate::volume::{EventFilter, EventKind, Volume};

/// How long background tasks get to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Network side of a node.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Where to accept online-sync peers, `host:port` or `tcp://host:port`.
    pub listen_sync_url: Option<String>,

    /// Peer to keep an online-sync session with.
    pub peer_url: Option<String>,

    /// Skip re-indexing on start.
    pub skip_populate: bool,
}

/// A running node.
pub struct SndbServer {
    config: ServerConfig,
    volume: Arc<Volume>,
    online: Arc<OnlineSync>,
    router: Arc<Router>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl SndbServer {
    /// Opens the volume and brings the index up to date.
    pub async fn new(volume_config: Config, resources: Vec<Metadata>, config: ServerConfig) -> Result<Self> {
        volume_config.validate()?;
        info!(
            node = %volume_config.node_id,
            data_root = %volume_config.data_root.display(),
            "Initializing sndb node"
        );

        let volume = Arc::new(Volume::open(volume_config, resources)?);
        if !config.skip_populate {
            let populated = volume.populate().await?;
            info!(documents = populated, "Index populated");
        }

        let online = OnlineSync::new(volume.clone())?;
        let router = Arc::new(Router::new(volume.clone()).with_online(online.clone()));

        info!("sndb node initialization complete");
        Ok(Self {
            config,
            volume,
            online,
            router,
            background_tasks: Vec::new(),
        })
    }

    /// Serves until `shutdown` resolves or an index writer dies, then closes the volume.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut died = self
            .volume
            .subscribe(EventFilter::default().events(&[EventKind::WriterDied]));

        if let Some(url) = &self.config.listen_sync_url {
            let addr = parse_socket_addr(url)?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, "Accepting online sync peers");
            let handle = tokio::spawn(accept_loop(listener, self.online.clone(), stop_rx.clone()));
            self.background_tasks.push(handle);
        }

        if let Some(peer) = &self.config.peer_url {
            info!(peer = %peer, "Starting online sync with peer");
            let online = self.online.clone();
            let connector = TcpConnector::new(strip_scheme(peer));
            let stop = stop_rx.clone();
            let handle = tokio::spawn(async move { online.run(&connector, stop).await });
            self.background_tasks.push(handle);
        }

        let result = tokio::select! {
            _ = shutdown => {
                info!("sndb node shutting down");
                Ok(())
            }
            Some(event) = died.recv() => {
                error!(resource = %event.resource, "Index writer died, stopping node");
                Err(Error::WriterDied)
            }
        };

        let _ = stop_tx.send(true);
        for handle in self.background_tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        self.volume.close().await?;
        info!("Volume closed");
        result
    }

    pub fn volume(&self) -> Arc<Volume> {
        self.volume.clone()
    }

    pub fn online(&self) -> Arc<OnlineSync> {
        self.online.clone()
    }

    /// Dispatcher for in-process callers.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Accepts peers one at a time; a second peer is turned away while one is online.
async fn accept_loop(listener: TcpListener, online: Arc<OnlineSync>, mut stop: watch::Receiver<bool>) {
    let mut sessions = Vec::new();
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        if online.is_online() {
            warn!(addr = %addr, "Rejecting peer, a session is already running");
            continue;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %addr, "Cannot set TCP_NODELAY: {}", e);
        }

        debug!(addr = %addr, "Peer connected");
        let online = online.clone();
        let stop = stop.clone();
        sessions.push(tokio::spawn(async move {
            match online.session(stream, stop).await {
                Ok(stats) => info!(
                    peer = %stats.peer,
                    pushed = stats.pushed,
                    merged = stats.merged,
                    "Online sync session ended"
                ),
                Err(e) => warn!(addr = %addr, "Online sync session failed: {}", e),
            }
        }));
        sessions.retain(|session| !session.is_finished());
    }

    for session in sessions {
        let _ = session.await;
    }
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

/// Parses a listen URL into a socket address.
fn parse_socket_addr(url: &str) -> Result<SocketAddr> {
    strip_scheme(url)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::InvalidValue(format!("cannot resolve {}", url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources;
    use crate::router::{Method, Request};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("tcp://127.0.0.1:5001").unwrap();
        assert_eq!(addr.port(), 5001);
        assert_eq!(parse_socket_addr("0.0.0.0:6000").unwrap().port(), 6000);
        assert!(parse_socket_addr("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_two_nodes_sync_over_tcp() {
        let temp_dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fast = |root: std::path::PathBuf, node: &str| Config {
            sync_backoff_min: Duration::from_millis(20),
            sync_backoff_max: Duration::from_millis(200),
            ..Config::new(root).with_flush(1, Duration::ZERO).with_node_id(node)
        };

        let a = SndbServer::new(
            fast(temp_dir.path().join("a"), "a"),
            resources::all().unwrap(),
            ServerConfig {
                listen_sync_url: Some(addr.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let b = SndbServer::new(
            fast(temp_dir.path().join("b"), "b"),
            resources::all().unwrap(),
            ServerConfig {
                peer_url: Some(format!("tcp://{}", addr)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let router_a = a.router();
        let volume_b = b.volume();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stopped = |mut rx: watch::Receiver<bool>| async move {
            let _ = rx.changed().await;
        };
        let task_a = tokio::spawn(a.run(stopped(stop_rx.clone())));
        let task_b = tokio::spawn(b.run(stopped(stop_rx)));

        let response = router_a
            .call(
                Request::new(Method::Post)
                    .path("context")
                    .json(&json!({"title": "shared"}))
                    .caller(crate::router::Caller::local()),
            )
            .await;
        assert_eq!(response.status, 200);
        let guid = response.to_json().unwrap().as_str().unwrap().to_string();

        let context = volume_b.directory("context").unwrap().clone();
        let mut replicated = false;
        for _ in 0..500 {
            if context.get(&guid).is_ok() {
                replicated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replicated);

        stop_tx.send(true).unwrap();
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
    }
}
