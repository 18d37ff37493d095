//! P2P Node CLI Application
//!
//! Runs the networking node until Ctrl+C.

use clap::{Parser, Subcommand};
use p2p_node::config::P2pConfig;
use p2p_node::network::{NetworkEvent, Node};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "p2p-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking node with NAT traversal", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the address database
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed addresses (comma-separated ip:port)
        #[arg(short, long)]
        seeds: Option<String>,

        /// Run as a seed node
        #[arg(long)]
        seed: bool,

        /// Do not accept inbound connections
        #[arg(long)]
        no_server: bool,

        /// Skip UPnP port mapping
        #[arg(long)]
        no_nat: bool,

        /// URL of a bootstrap address list
        #[arg(long)]
        bootstrap_url: Option<String>,

        /// Seconds between status lines
        #[arg(long, default_value = "60")]
        status_secs: u64,
    },

    /// Write a default config file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "p2p.json")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) if path.exists() => P2pConfig::load(path)?,
        Some(path) => {
            log::warn!("Config {} not found, using defaults", path.display());
            P2pConfig::default()
        }
        None => P2pConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        cfg.data_dir = dir.clone();
    }

    match cli.command {
        Commands::InitConfig { output } => {
            cfg.save(&output)?;
            println!("✅ Wrote config to {}", output.display());
        }

        Commands::Start {
            port,
            seeds,
            seed,
            no_server,
            no_nat,
            bootstrap_url,
            status_secs,
        } => {
            if let Some(port) = port {
                cfg.default_port = port;
            }
            if let Some(seeds) = seeds {
                cfg.seeds = seeds
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            cfg.is_seed |= seed;
            if no_server {
                cfg.server_start = false;
            }
            if no_nat {
                cfg.nat.enabled = false;
            }
            if bootstrap_url.is_some() {
                cfg.bootstrap_url = bootstrap_url;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(cfg, Duration::from_secs(status_secs.max(1))))?;
        }
    }

    Ok(())
}

async fn run_node(cfg: P2pConfig, status_every: Duration) -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 Starting P2P node on port {}", cfg.default_port);

    let node = Arc::new(Node::new(cfg)?);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<NetworkEvent>();
    node.set_queue_client(Arc::new(events_tx));
    node.start().await?;

    let mut status = tokio::time::interval(status_every);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\n📴 Shutting down node...");
                break;
            }
            Some(event) = events_rx.recv() => match event {
                NetworkEvent::PeerAdded(addr) => log::info!("Peer connected: {}", addr),
                NetworkEvent::PeerRemoved(addr) => log::info!("Peer disconnected: {}", addr),
                NetworkEvent::ServiceChanged(services) => {
                    log::info!("Advertised services: {:?}", services)
                }
                NetworkEvent::NatFinished(ok) => log::info!("NAT mapping ok: {}", ok),
            },
            _ = status.tick() => {
                let s = node.status();
                println!(
                    "📊 {} | external {} | outside {} | nat {} | peers {} ({} active) | known {}",
                    &s.node_name[..s.node_name.len().min(8)],
                    s.external_addr.as_deref().unwrap_or("-"),
                    s.outside,
                    s.nat_done,
                    s.outbound,
                    s.active,
                    s.known_addrs
                );
            }
        }
    }

    node.close().await;
    Ok(())
}
