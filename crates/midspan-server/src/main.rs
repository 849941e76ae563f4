//! midspan proxy server binary.
//!
//! Thin runtime glue: accept TCP connections, parse the HTTP/1.x edge,
//! and drive the transaction state machine from `midspan-core`, executing
//! the actions it returns. All protocol decisions live in the core; this
//! binary only moves bytes.

mod cache_store;
mod transport;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use midspan_core::ProxyConfig;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::transport::{ConnectionDriver, SharedState};

/// midspan caching proxy.
#[derive(Parser, Debug)]
#[command(name = "midspan-server", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Optional JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum redirect chain length to follow
    #[arg(long)]
    redirects: Option<u32>,
}

fn load_config(args: &Args) -> ProxyConfig {
    let mut config = match &args.config {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    error!(%err, path = %path.display(), "bad configuration file, using defaults");
                    ProxyConfig::default()
                }
            },
            Err(err) => {
                error!(%err, path = %path.display(), "unreadable configuration file, using defaults");
                ProxyConfig::default()
            }
        },
        None => ProxyConfig::default(),
    };

    if let Some(redirects) = args.redirects {
        config.number_of_redirections = redirects;
    }
    config
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Arc::new(load_config(&args));
    let shared = Arc::new(SharedState::new(Arc::clone(&config)));

    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "midspan listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "accept failed");
                continue;
            }
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let driver = ConnectionDriver::new(stream, peer, shared);
            if let Err(err) = driver.run().await {
                tracing::debug!(%err, %peer, "connection ended with error");
            }
        });
    }
}
