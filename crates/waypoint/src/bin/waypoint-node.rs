//! Runs one Central or Content node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use waypoint::Connector;
use waypoint::prelude::*;
use waypoint_protocol::ServerAddress;
use waypoint_session::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "waypoint-node", version, about = "Waypoint Central/Content node")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(short, long, value_name = "FILE", default_value = "waypoint.toml")]
    config: PathBuf,

    /// Overrides `node.name`.
    #[arg(short, long)]
    name: Option<String>,

    /// Overrides `node.role`.
    #[arg(short, long, value_enum)]
    role: Option<Role>,

    /// Overrides `node.bind_address`.
    #[arg(short, long, value_name = "ADDRESS")]
    bind: Option<String>,

    /// Overrides `logging.level`.
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output logs in JSON format.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_config(&self) -> Result<NodeConfig, WaypointError> {
        let mut config = if self.config.exists() {
            NodeConfig::load_from_file(&self.config)?
        } else {
            NodeConfig::default()
        };
        if let Some(name) = &self.name {
            config.node.name = name.clone();
        }
        if let Some(role) = self.role {
            config.node.role = role;
        }
        if let Some(bind) = &self.bind {
            config.node.bind_address = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    waypoint::logging::init(&config.logging, cli.json_logs)?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    let central_address = config.content.central_address.clone();
    let node = Node::start(config, Arc::new(MemoryStore::new())).await;

    if node.role() == Role::Content {
        match central_address {
            Some(address) => {
                let central = ServerAddress {
                    name: "Central".to_string(),
                    address,
                };
                let conduit = WsConnector.connect(&central).await?;
                node.attach_parent(conduit).await?;
            }
            None => warn!(node = %node.name(), "no central_address configured, running standalone"),
        }
    }

    let server = NodeServer::bind(Arc::clone(&node)).await?;
    let serve = server.run();
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!(error = %e, "server loop failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    node.shutdown().await;
    Ok(())
}
