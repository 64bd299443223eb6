//! # sndb - replicated document store node
//!
//! Entry point for serving a volume, exchanging sneakernet packets and poking at the
//! local index.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use sndb::sync::{self, SyncState};
use sndb::{resources, Config, Error, FindRequest, ServerConfig, SndbServer, Volume};

/// A replicated, schema-driven document store.
///
/// Each node keeps its own copy of the users, contexts and posts it knows about and
/// reconciles it with a peer online or through packet files carried by hand.
#[derive(Parser, Debug)]
#[command(name = "sndb", version, about = "A replicated, schema-driven document store")]
struct Args {
    /// Volume root.
    #[arg(long, default_value = "sndb-data")]
    data_dir: PathBuf,

    /// Node id used in packets and online sync. Random when omitted.
    #[arg(long)]
    node_id: Option<String>,

    /// Preferred languages, best first, comma separated.
    #[arg(long, default_value = "en")]
    languages: String,

    /// Writes that trigger an index commit.
    #[arg(long, default_value_t = 32)]
    flush_threshold: usize,

    /// Seconds between timer commits (0 disables the timer).
    #[arg(long, default_value_t = 5)]
    flush_timeout: u64,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the volume and keep it in sync with a peer.
    Serve {
        /// Accept online-sync peers on this address.
        #[arg(long)]
        listen_sync_url: Option<String>,

        /// Keep an online-sync session with this peer.
        #[arg(long)]
        peer_url: Option<String>,

        /// Seconds between sync (ack) rounds.
        #[arg(long, default_value_t = 60)]
        sync_interval: u64,

        /// Do not re-index on start.
        #[arg(long, default_value_t = false)]
        skip_populate: bool,
    },

    /// Write pending changes into a packet in DIR.
    Export {
        dir: PathBuf,

        /// Address the packet to one node.
        #[arg(long)]
        receiver: Option<String>,

        /// Packet size limit in bytes.
        #[arg(long)]
        packet_limit: Option<u64>,
    },

    /// Merge the packets found in DIR.
    Import { dir: PathBuf },

    /// Import from DIR, then export into it.
    Exchange { dir: PathBuf },

    /// Search a resource and print matches as JSON lines.
    Find {
        resource: String,

        #[arg(long)]
        query: Option<String>,

        /// Sort properties, `-` prefix for descending.
        #[arg(long)]
        order_by: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Properties to print, comma separated.
        #[arg(long)]
        reply: Option<String>,
    },

    /// Re-index documents changed since the last index commit.
    Populate,

    /// Drop and rebuild the index of a resource, or of all of them.
    Rebuild { resource: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_config(&args);
    config.validate().context("invalid configuration")?;

    match args.command {
        Command::Serve {
            listen_sync_url,
            peer_url,
            sync_interval,
            skip_populate,
        } => {
            let config = Config {
                sync_interval: Duration::from_secs(sync_interval.max(1)),
                ..config
            };
            let server_config = ServerConfig {
                listen_sync_url,
                peer_url,
                skip_populate,
            };
            let server = SndbServer::new(config, resources::all()?, server_config).await?;
            let shutdown = setup_signal_handlers();

            info!("Starting sndb node...");
            match server.run(shutdown).await {
                Ok(()) => {
                    info!("Node shut down gracefully");
                    Ok(())
                }
                Err(e) => {
                    error!("Node error: {:?}", e);
                    Err(e.into())
                }
            }
        }
        Command::Export {
            dir,
            receiver,
            packet_limit,
        } => {
            let config = match packet_limit {
                Some(limit) => Config {
                    packet_limit: limit,
                    packet_reserve: (limit / 100).min(config.packet_reserve),
                    ..config
                },
                None => config,
            };
            let volume = Volume::open(config, resources::all()?)?;
            let mut state = SyncState::open(volume.root())?;
            let result = sync::export(&volume, &mut state, &dir, receiver, None).await;
            volume.close().await?;
            match result {
                Ok(stats) => {
                    println!(
                        "exported {} documents, committed {}",
                        stats.exported, stats.committed
                    );
                    Ok(())
                }
                Err(Error::DiskFull { written }) => {
                    warn!(written, "Packet is full, run export again with a fresh medium");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Import { dir } => {
            let volume = Volume::open(config, resources::all()?)?;
            let mut state = SyncState::open(volume.root())?;
            let result = sync::import(&volume, &mut state, &dir).await;
            volume.close().await?;
            let stats = result?;
            println!("imported {} packets, merged {} documents", stats.packets, stats.merged);
            Ok(())
        }
        Command::Exchange { dir } => {
            let volume = Volume::open(config, resources::all()?)?;
            let result = sync::exchange(&volume, &dir).await;
            volume.close().await?;
            let stats = result?;
            println!(
                "imported {} packets, merged {} documents, exported {} documents",
                stats.packets, stats.merged, stats.exported
            );
            Ok(())
        }
        Command::Find {
            resource,
            query,
            order_by,
            offset,
            limit,
            reply,
        } => {
            let languages = config.languages.clone();
            let volume = Volume::open(config, resources::all()?)?;
            let request = FindRequest {
                query,
                order_by: order_by.map(|order| parse_list(&order)).unwrap_or_default(),
                offset,
                limit: Some(limit),
                reply: reply.map(|reply| parse_list(&reply)).unwrap_or_default(),
                languages: languages.clone(),
                ..Default::default()
            };
            let result = find(&volume, &resource, &request, &languages);
            volume.close().await?;
            let total = result?;
            eprintln!("{} total", total);
            Ok(())
        }
        Command::Populate => {
            let volume = Volume::open(config, resources::all()?)?;
            let result = volume.populate().await;
            volume.close().await?;
            println!("populated {} documents", result?);
            Ok(())
        }
        Command::Rebuild { resource } => {
            let volume = Volume::open(config, resources::all()?)?;
            let result = rebuild(&volume, resource.as_deref()).await;
            volume.close().await?;
            println!("re-indexed {} documents", result?);
            Ok(())
        }
    }
}

fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn build_config(args: &Args) -> Config {
    let languages = parse_list(&args.languages);
    let mut config = Config::new(&args.data_dir)
        .with_flush(args.flush_threshold, Duration::from_secs(args.flush_timeout));
    if let Some(node_id) = &args.node_id {
        config = config.with_node_id(node_id.clone());
    }
    if let Some(first) = languages.first() {
        config.default_language = first.clone();
        config = config.with_languages(languages);
    }
    config
}

fn find(volume: &Volume, resource: &str, request: &FindRequest, languages: &[String]) -> sndb::Result<usize> {
    let directory = volume.directory(resource)?;
    let (documents, total) = directory.find(request)?;
    for document in documents {
        let mut props = document.to_json(&request.reply, languages)?;
        props.insert("guid".to_string(), serde_json::json!(document.guid()));
        println!("{}", serde_json::Value::Object(props));
    }
    Ok(total)
}

async fn rebuild(volume: &Volume, resource: Option<&str>) -> sndb::Result<usize> {
    let mut total = 0;
    for directory in volume.directories() {
        if resource.map_or(true, |name| name == directory.name()) {
            total += directory.rebuild_index().await?;
        }
    }
    if let Some(name) = resource {
        volume.directory(name)?;
    }
    Ok(total)
}

/// Splits a comma-separated flag value.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Resolves on SIGTERM or SIGINT.
fn setup_signal_handlers() -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Cannot install signal handlers ({}), waiting for Ctrl-C", e);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
    }
}
