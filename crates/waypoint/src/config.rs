//! Node configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working single-node Central. Session keys also accept the legacy
//! PascalCase names (`PlayerAuthticketExpirationSecs`, ...).
//!
//! ```toml
//! [node]
//! name = "Content1"
//! role = "content"
//! bind_address = "127.0.0.1:7101"
//!
//! [content]
//! central_address = "ws://127.0.0.1:7100"
//! public_address = "ws://127.0.0.1:7101"
//!
//! [cluster]
//! secret = "change-me"
//!
//! [session]
//! PlayerAuthticketExpirationSecs = 300
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use waypoint_game::GameConfig;
use waypoint_session::SessionConfig;

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which half of the cluster a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Central,
    Content,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Central => write!(f, "central"),
            Self::Content => write!(f, "content"),
        }
    }
}

fn default_name() -> String {
    "Central".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:7100".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_ticket_lifetime_secs() -> u64 {
    300
}

fn default_ticket_sweep_secs() -> u64 {
    15
}

fn default_cache_lifetime_mins() -> u64 {
    5
}

fn default_cache_sweep_secs() -> u64 {
    30
}

fn default_message_log_capacity() -> usize {
    100
}

fn default_lobby_purge_secs() -> u64 {
    60
}

fn default_started_purge_secs() -> u64 {
    300
}

fn default_directory_sweep_secs() -> u64 {
    10
}

fn default_max_games() -> usize {
    100
}

fn default_level() -> String {
    "info".to_string()
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub session: SessionSettings,
    pub games: GameSettings,
    pub central: CentralSettings,
    pub content: ContentSettings,
    pub cluster: ClusterSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Server name tickets are targeted at.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Hand inbound packets to a per-connection serial queue instead of
    /// running handlers on the reader task.
    #[serde(default)]
    pub queue_inbound: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            role: Role::default(),
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            queue_inbound: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(
        default = "default_ticket_lifetime_secs",
        alias = "PlayerAuthticketExpirationSecs"
    )]
    pub ticket_lifetime_secs: u64,
    #[serde(
        default = "default_ticket_sweep_secs",
        alias = "PlayerAuthticketExpirationCheckIntervalSecs"
    )]
    pub ticket_sweep_secs: u64,
    #[serde(
        default = "default_cache_lifetime_mins",
        alias = "CharacterCacheExpirationIntervalMins"
    )]
    pub character_cache_lifetime_mins: u64,
    #[serde(default = "default_cache_sweep_secs")]
    pub character_cache_sweep_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ticket_lifetime_secs: default_ticket_lifetime_secs(),
            ticket_sweep_secs: default_ticket_sweep_secs(),
            character_cache_lifetime_mins: default_cache_lifetime_mins(),
            character_cache_sweep_secs: default_cache_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSettings {
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
    #[serde(default = "default_lobby_purge_secs")]
    pub abandoned_lobby_purge_secs: u64,
    #[serde(default = "default_started_purge_secs")]
    pub abandoned_started_purge_secs: u64,
    #[serde(default = "default_directory_sweep_secs")]
    pub directory_sweep_secs: u64,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            message_log_capacity: default_message_log_capacity(),
            abandoned_lobby_purge_secs: default_lobby_purge_secs(),
            abandoned_started_purge_secs: default_started_purge_secs(),
            directory_sweep_secs: default_directory_sweep_secs(),
        }
    }
}

/// Central-only settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CentralSettings {
    /// Content servers known before any of them connects.
    pub content_servers: Vec<ContentServerEntry>,
}

/// A statically configured Content server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentServerEntry {
    pub name: String,
    /// Address clients are sent to.
    pub address: String,
    #[serde(default = "default_max_games")]
    pub max_games: usize,
}

/// Settings shared by every node of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClusterSettings {
    /// Presented by a Content node in its `ServerHello`. Central refuses
    /// every announcement while this is unset.
    pub secret: Option<String>,
}

/// Content-only settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSettings {
    /// Central's address; when set the node dials it as its parent link.
    #[serde(default)]
    pub central_address: Option<String>,
    /// Address announced to Central for clients to connect to. Defaults
    /// to `ws://{bind_address}`.
    #[serde(default)]
    pub public_address: Option<String>,
    #[serde(default = "default_max_games")]
    pub max_games: usize,
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            central_address: None,
            public_address: None,
            max_games: default_max_games(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl NodeConfig {
    /// Reads and parses a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// A config for an in-process node with the given name and role.
    pub fn named(name: impl Into<String>, role: Role) -> Self {
        let mut config = Self::default();
        config.node.name = name.into();
        config.node.role = role;
        config
    }

    /// Clamps out-of-range values with a warning.
    pub fn validated(mut self) -> Self {
        if self.node.name.trim().is_empty() {
            warn!("empty node name, using default");
            self.node.name = default_name();
        }
        if self.session.ticket_sweep_secs == 0 {
            warn!("ticket_sweep_secs of zero, using default");
            self.session.ticket_sweep_secs = default_ticket_sweep_secs();
        }
        if self.session.character_cache_lifetime_mins == 0 {
            warn!("character cache lifetime below one minute, clamping");
            self.session.character_cache_lifetime_mins = 1;
        }
        if self.session.character_cache_sweep_secs == 0 {
            warn!("character_cache_sweep_secs of zero, using default");
            self.session.character_cache_sweep_secs = default_cache_sweep_secs();
        }
        if self.games.directory_sweep_secs == 0 {
            warn!("directory_sweep_secs of zero, using default");
            self.games.directory_sweep_secs = default_directory_sweep_secs();
        }
        if self.content.max_games == 0 {
            warn!("content max_games of zero would refuse every game, using default");
            self.content.max_games = default_max_games();
        }
        self
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ticket_lifetime: Duration::from_secs(self.session.ticket_lifetime_secs),
            ticket_sweep_interval: Duration::from_secs(self.session.ticket_sweep_secs),
            character_cache_lifetime: Duration::from_secs(
                self.session.character_cache_lifetime_mins.saturating_mul(60),
            ),
            character_cache_sweep_interval: Duration::from_secs(
                self.session.character_cache_sweep_secs,
            ),
            max_connections: self.node.max_connections,
        }
        .validated()
    }

    pub fn game_config(&self) -> GameConfig {
        GameConfig {
            message_log_capacity: self.games.message_log_capacity,
            abandoned_lobby_purge: Duration::from_secs(self.games.abandoned_lobby_purge_secs),
            abandoned_started_purge: Duration::from_secs(self.games.abandoned_started_purge_secs),
            directory_sweep_interval: Duration::from_secs(self.games.directory_sweep_secs),
        }
        .validated()
    }

    /// Address this node announces to Central.
    pub fn public_address(&self) -> String {
        self.content
            .public_address
            .clone()
            .unwrap_or_else(|| format!("ws://{}", self.node.bind_address))
    }
}
