//! `canopy run`: one node with the status service, until ctrl-c.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use canopy_overlay::{Server, ServerConfig, ServerToml, ServiceRegistry, StatusService};

pub async fn run(config: &Path, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let toml = ServerToml::load(config).with_context(|| format!("reading {}", config.display()))?;

    let services = Arc::new(ServiceRegistry::new());
    StatusService::register(&services)?;

    let mut server_config = ServerConfig::new();
    if let Some(dir) = data_dir {
        server_config = server_config.db_dir(dir);
    }
    let server = Server::builder_from_toml(&toml)?
        .config(server_config)
        .services(services)
        .build()
        .await?;
    server.start().await?;

    eprintln!("canopy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Public key: {}", server.server_identity().public.to_hex());
    eprintln!("Listening on {}", server.address());
    if let Some(addr) = server.websocket().and_then(|ws| ws.local_addr()) {
        eprintln!("Websocket on {addr}");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    let lingering = server.close().await?;
    if lingering > 0 {
        tracing::warn!("{lingering} protocol instances still running at shutdown");
    }
    Ok(())
}
