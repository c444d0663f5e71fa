use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ma_magnet_gateway::swarm::webseed::WebSeedEngine;
use ma_magnet_gateway::{Gateway, GatewayConfig, GatewayServer};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load()?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let gateway = Arc::new(Gateway::new(config, Arc::new(WebSeedEngine::new()))?);

    let server = GatewayServer::start(gateway, addr).await?;
    info!("streaming at http://{}:{}/stream?magnet=...", addr.ip(), server.port());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
