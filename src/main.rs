use std::path::PathBuf;

use clap::Parser;
use rand::RngCore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lumen_node::config::NodeConfig;
use lumen_node::p2p::audit::blacklist::new_blacklist_manager;
use lumen_node::p2p::message::{ChainId, PeerAddress, PeerId, Status};
use lumen_node::p2p::server::PeerServer;
use lumen_node::p2p::{ActorHandle, SyncEvent};

#[derive(Parser)]
#[command(name = "lumen-node", version, about = "Lumen blockchain node")]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Bootstrap peers to dial at startup (host:port, repeatable).
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for persistent node state (blacklist, keys).
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Disable the peer audit/blacklist subsystem entirely.
    #[arg(long)]
    no_audit: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut conf = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = args.listen {
        conf.network.listen_addr = listen;
    }
    if args.no_audit {
        conf.audit.enable_audit = false;
    }

    // TODO: load the identity from a persisted node key in data_dir
    let mut id_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id_bytes);
    let peer_id = PeerId(id_bytes);
    info!("node identity {}", peer_id.short());

    let (advertise_addr, port) = split_listen_addr(&conf.network.listen_addr);
    let local_status = Status {
        chain_id: ChainId::from_bytes(conf.network.chain_id.clone().into_bytes()),
        sender: PeerAddress {
            address: advertise_addr,
            port,
            peer_id,
        },
        best_block_hash: vec![0u8; 32],
        best_height: 0,
    };

    let blacklist = new_blacklist_manager(&conf.audit, args.data_dir.clone());
    blacklist.start();

    let (actor, mut events) = ActorHandle::channel();
    let server = PeerServer::new(conf.network.clone(), local_status, blacklist.clone(), actor);

    for addr in &args.peers {
        match server.connect(addr).await {
            Ok(id) => info!("connected to bootstrap peer {} at {}", id.short(), addr),
            Err(err) => warn!("failed to connect to bootstrap peer {}: {}", addr, err),
        }
    }

    let listen_server = server.clone();
    tokio::spawn(async move {
        if let Err(err) = listen_server.listen().await {
            error!("peer listener failed: {}", err);
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            Some(event) = events.recv() => match event {
                SyncEvent::BlockChunks { from, result } => match result {
                    Ok(blocks) => {
                        info!("received {} blocks from {}", blocks.len(), from.short());
                    }
                    Err(err) => {
                        warn!("block fetch from {} failed: {}", from.short(), err);
                    }
                },
            },
        }
    }

    blacklist.stop();
    Ok(())
}

fn split_listen_addr(listen_addr: &str) -> (String, u16) {
    match listen_addr.rsplit_once(':') {
        Some((host, port)) => {
            let host = if host == "0.0.0.0" || host.is_empty() {
                "127.0.0.1"
            } else {
                host
            };
            (host.to_string(), port.parse().unwrap_or(7846))
        }
        None => (listen_addr.to_string(), 7846),
    }
}
