//! # Waypoint
//!
//! Session handoff and game hosting for a Central/Content server cluster.
//!
//! A client logs in to Central with a ticket, asks Central to create, join
//! or quick-match a game, and is handed a fresh ticket for the Content
//! server hosting it. The Content server validates that ticket, admits the
//! character and runs the game's in-match traffic until it ends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use waypoint::prelude::*;
//! use waypoint_session::MemoryStore;
//!
//! # async fn run() -> Result<(), WaypointError> {
//! let config = NodeConfig::named("Central", Role::Central);
//! let node = Node::start(config, Arc::new(MemoryStore::new())).await;
//! NodeServer::bind(node).await?.run().await
//! # }
//! ```

mod central;
mod client;
mod cluster;
pub mod config;
mod content;
mod error;
pub mod logging;
mod node;
mod server;
mod session;
mod worker;

pub use central::{Central, HelloRejection, PlacementError, QuickMatch};
pub use client::{
    ClientConfig, ClientEvent, Connector, GameClient, LocalConnector, REASON_CLIENT_DISCONNECT,
};
pub use cluster::{ClusterDirectory, ContentServerInfo};
pub use config::{ConfigError, NodeConfig, Role};
pub use content::{AdmissionError, Content, HostedGame};
pub use error::WaypointError;
pub use node::{Node, Peer, REASON_SHUTDOWN};
pub use server::{NodeServer, WsConnector};
pub use worker::Conduit;

pub mod prelude {
    pub use crate::{
        ClientConfig, ClientEvent, GameClient, LocalConnector, Node, NodeConfig, NodeServer, Role,
        WaypointError, WsConnector,
    };
}
