mod liveness;

use agent_shared::{serve::serve_connection, MemoryStore, TreeStore};
use clap::Parser;
use liveness::LivenessSweeper;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tree-server", version, about = "In-memory tree store served over TCP")]
struct Cli {
    /// Listen address
    #[arg(long, env = "TREE_SERVER_LISTEN", default_value = "0.0.0.0:7070")]
    listen: String,

    /// Path prefix under which device roots live
    #[arg(long, env = "TREE_SERVER_ROOT", default_value = "devices")]
    root: String,

    /// Expected device heartbeat period in seconds
    #[arg(long, env = "TREE_SERVER_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let memory = MemoryStore::new();
    let store: Arc<dyn TreeStore> = Arc::new(memory.clone());

    let period = Duration::from_secs(cli.heartbeat_secs.max(1));
    tokio::spawn(LivenessSweeper::new(memory, cli.root.clone(), period).run());

    let listener = TcpListener::bind(&cli.listen).await?;
    info!("Tree server listening on {} (root {})", cli.listen, cli.root);

    loop {
        let (socket, addr) = listener.accept().await?;
        info!("Connection from: {}", addr);

        let store = store.clone();
        tokio::spawn(async move {
            match serve_connection(socket, store).await {
                Ok(()) => info!("Client disconnected: {}", addr),
                Err(e) => warn!("Connection {} closed with error: {}", addr, e),
            }
        });
    }
}
