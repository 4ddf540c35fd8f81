//! Standalone relay binary.
//!
//! Usage:
//!   cargo run -p sync_relay -- [--config relay.json] [--addr 127.0.0.1:8080] [--capacity 2]
//!
//! Clients connect with `ws://<addr>` and send `{"type":"hello","game":"<name>"}`.

use std::env;

use anyhow::Context;
use sync_relay::RelayServer;
use sync_shared::config::RelayConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<RelayConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => RelayConfig::load(&args[i + 1])?,
        _ => RelayConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--capacity" if i + 1 < args.len() => {
                cfg.capacity = args[i + 1].parse().unwrap_or(2);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.listen_addr, capacity = cfg.capacity, "Starting relay");

    let server = RelayServer::bind(cfg).await.context("bind relay")?;
    info!(url = %server.url()?, "Relay ready");
    server.run().await
}
