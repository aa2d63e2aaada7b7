//! Waypost node: a delay-tolerant bundle substrate relay.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use waypost::config::{NodeConfig, Role};
use waypost::crypto::Keypair;
use waypost::net::run_session;
use waypost::store::Storage;
use waypost::substrate::Substrate;
use waypost::types::PeerId;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "waypost", version, about = "Waypost: delay-tolerant bundle substrate")]
struct Args {
    /// Role preset: producer, bridge, library, constrained
    #[arg(short, long)]
    role: Option<Role>,

    /// Data directory for the sled store and node key
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Address to listen on for incoming peer sessions
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peers to dial at startup (comma-separated host:port)
    #[arg(short, long)]
    peers: Option<String>,
}

fn load_or_generate_key(data_dir: &std::path::Path) -> std::io::Result<Keypair> {
    let key_path = data_dir.join("node.key");
    if let Ok(bytes) = std::fs::read(&key_path) {
        if let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return Ok(Keypair::from_secret_bytes(&secret));
        }
        warn!("node.key has the wrong length, regenerating");
    }
    let keypair = Keypair::generate();
    std::fs::write(&key_path, keypair.secret_bytes())?;
    Ok(keypair)
}

async fn accept_loop(listener: TcpListener, substrate: Arc<Substrate>, budget_bytes: u64) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let substrate = substrate.clone();
                tokio::spawn(async move {
                    info!(%addr, "inbound session");
                    if let Err(e) = run_session(socket, substrate, None, budget_bytes).await {
                        warn!(%addr, error = %e, "inbound session ended with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn dial_peer(addr: SocketAddr, substrate: Arc<Substrate>, expected: Option<PeerId>, budget_bytes: u64) {
    match TcpStream::connect(addr).await {
        Ok(socket) => {
            info!(%addr, "outbound session");
            if let Err(e) = run_session(socket, substrate, expected, budget_bytes).await {
                warn!(%addr, error = %e, "outbound session ended with error");
            }
        }
        Err(e) => warn!(%addr, error = %e, "failed to connect"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("waypost=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("════════════════════════════════════════════════════════════");
    info!("  Waypost v{VERSION} — bundle substrate node");
    info!("════════════════════════════════════════════════════════════");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!(error = %e, "failed to create data directory");
        return;
    }

    let keypair = match load_or_generate_key(&args.data_dir) {
        Ok(k) => k,
        Err(e) => {
            error!(error = %e, "failed to load or generate node key");
            return;
        }
    };
    info!(peer_id = %hex::encode(keypair.public_key()), "node identity");

    let storage = match Storage::open(&args.data_dir.join("store")) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open storage");
            return;
        }
    };

    let mut config = match args.role {
        Some(role) => {
            info!(?role, "role preset selected");
            NodeConfig::from_role(role, args.data_dir.clone())
        }
        None => NodeConfig::default_with_data_dir(args.data_dir.clone()),
    };
    config.listen_addr = args.listen;

    let substrate = Substrate::new(storage, keypair, config.clone());
    let (background, shutdown_tx) = substrate.spawn_background_tasks();

    if let Some(listen_addr) = config.listen_addr {
        match TcpListener::bind(listen_addr).await {
            Ok(listener) => {
                info!(%listen_addr, "listening for peer sessions");
                let substrate = substrate.clone();
                let budget = config.cache_budget_bytes;
                tokio::spawn(accept_loop(listener, substrate, budget));
            }
            Err(e) => error!(%listen_addr, error = %e, "failed to bind listener"),
        }
    }

    for peer in args.peers.iter().flat_map(|s| s.split(',')).filter(|s| !s.trim().is_empty()) {
        match peer.trim().parse::<SocketAddr>() {
            Ok(addr) => {
                let substrate = substrate.clone();
                let budget = config.cache_budget_bytes;
                tokio::spawn(dial_peer(addr, substrate, None, budget));
            }
            Err(e) => warn!(peer, error = %e, "invalid peer address, skipping"),
        }
    }

    info!("waypost running, awaiting shutdown signal");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down, draining in-flight sweep/eviction ticks");
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task panicked during shutdown");
        }
    }
    let _ = substrate.storage.flush();
}
