use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use finreview_realtime::server::{self, Hub, config::Config};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "finreview_realtime=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.json_logs);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        heartbeat = ?config.heartbeat_interval(),
        "starting real-time server"
    );

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let hub = Arc::new(Hub::new(config.heartbeat_interval()));

    server::serve(listener, hub).await?;

    tracing::info!("real-time server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .init();
    }
}
