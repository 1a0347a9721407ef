use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nudge_server::config::ServerConfig;
use nudge_server::{AppState, serve};

#[derive(Parser, Debug)]
#[command(author, version, about = "nudge notification server")]
struct Args {
    /// Path to config.toml (defaults to the XDG config dir)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// SQLite database path, or ":memory:"
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nudge_server=info,libnudge=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(database) = args.database {
        config.database = database;
    }
    config.validate()?;

    let store = config.open_store()?;
    let listen = config.listen;
    let reaper_interval = config.reaper_interval();
    let state = AppState::new(config, store);

    let cancel = CancellationToken::new();
    let reaper = state
        .sessions
        .clone()
        .spawn_reaper(reaper_interval, cancel.clone());

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind listener on {listen}"))?;
    info!("nudge-server listening on http://{listen}");

    let result = serve(listener, state, shutdown_signal()).await;

    cancel.cancel();
    if let Err(e) = reaper.await {
        warn!("reaper task ended abnormally: {e}");
    }
    info!("nudge-server stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
