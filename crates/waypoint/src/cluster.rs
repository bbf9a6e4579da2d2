//! Central's view of the Content servers it can place games on.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, info};
use waypoint_protocol::{ConnectionId, ServerAddress};

use crate::config::ContentServerEntry;

/// One Content server as Central sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentServerInfo {
    pub name: String,
    /// Address clients are sent to.
    pub address: String,
    pub max_games: usize,
    /// Games placed here and not yet reported removed.
    pub hosted_games: usize,
    pub online: bool,
    /// Parent link the server announced itself on, if any.
    pub link: Option<ConnectionId>,
}

impl ContentServerInfo {
    pub fn server_address(&self) -> ServerAddress {
        ServerAddress {
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.online && self.hosted_games < self.max_games
    }
}

/// Content servers keyed by name.
#[derive(Default)]
pub struct ClusterDirectory {
    servers: RwLock<BTreeMap<String, ContentServerInfo>>,
}

impl ClusterDirectory {
    /// Seeds the directory with statically configured servers. They start
    /// online so placement works before (or without) a parent link.
    pub fn new(entries: &[ContentServerEntry]) -> Self {
        let servers = entries
            .iter()
            .map(|e| {
                (
                    e.name.to_lowercase(),
                    ContentServerInfo {
                        name: e.name.clone(),
                        address: e.address.clone(),
                        max_games: e.max_games,
                        hosted_games: 0,
                        online: true,
                        link: None,
                    },
                )
            })
            .collect();
        Self {
            servers: RwLock::new(servers),
        }
    }

    /// Records a `ServerHello`. Known servers keep their hosted count.
    pub async fn announce(&self, name: &str, address: &str, max_games: usize, link: ConnectionId) {
        let mut servers = self.servers.write().await;
        let server = servers
            .entry(name.to_lowercase())
            .or_insert_with(|| ContentServerInfo {
                name: name.to_string(),
                address: address.to_string(),
                max_games,
                hosted_games: 0,
                online: true,
                link: None,
            });
        server.address = address.to_string();
        server.max_games = max_games;
        server.online = true;
        server.link = Some(link);
        info!(server = %name, %address, max_games, conn_id = %link, "content server online");
    }

    /// Marks the server announced on `link` offline. Its games are gone with
    /// it, so the hosted count resets.
    pub async fn mark_offline(&self, link: ConnectionId) -> Option<String> {
        let mut servers = self.servers.write().await;
        let server = servers.values_mut().find(|s| s.link == Some(link))?;
        server.online = false;
        server.link = None;
        server.hosted_games = 0;
        info!(server = %server.name, conn_id = %link, "content server offline");
        Some(server.name.clone())
    }

    /// Picks the online server with the fewest hosted games and spare
    /// capacity, and reserves a slot on it in the same step.
    pub async fn reserve_least_loaded(&self) -> Option<ContentServerInfo> {
        let mut servers = self.servers.write().await;
        let server = servers
            .values_mut()
            .filter(|s| s.has_capacity())
            .min_by_key(|s| s.hosted_games)?;
        server.hosted_games += 1;
        debug!(server = %server.name, hosted = server.hosted_games, "game slot reserved");
        Some(server.clone())
    }

    /// Gives back a slot taken by [`reserve_least_loaded`](Self::reserve_least_loaded).
    pub async fn release(&self, name: &str) {
        if let Some(server) = self.servers.write().await.get_mut(&name.to_lowercase()) {
            server.hosted_games = server.hosted_games.saturating_sub(1);
        }
    }

    pub async fn get(&self, name: &str) -> Option<ContentServerInfo> {
        self.servers.read().await.get(&name.to_lowercase()).cloned()
    }

    pub async fn servers(&self) -> Vec<ContentServerInfo> {
        self.servers.read().await.values().cloned().collect()
    }
}
