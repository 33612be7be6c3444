//! Scribe server: hosts one shared document for a collaborative session.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use scribe_collab::server::{ServerConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "scribe-server", version, about = "Collaborative editing server")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Session password, overrides the config file
    #[arg(short, long, env = "SCRIBE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Maximum connected peers, overrides the config file
    #[arg(long)]
    max_peers: Option<usize>,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.server_config()?;
    if config.password.is_empty() {
        log::warn!("No password set, any client can join");
    }

    let server = SyncServer::new(config);
    info!("Starting Scribe server on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            server.shutdown("server shutting down").await;
            let stats = server.stats().await;
            info!(
                "Served {} connections, {} operations accepted, final revision {}",
                stats.total_connections, stats.accepted_operations, stats.revision
            );
        }
    }
    Ok(())
}
