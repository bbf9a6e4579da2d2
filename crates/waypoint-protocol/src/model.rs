//! Fixed-schema wire snapshots for characters and games.
//!
//! Each entity that crosses a node boundary has exactly one shape here.
//! There is no generic component tree: adding a field means adding it to
//! the struct.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, CharacterId, GameId};

/// Property key a client reports its loading progress under.
pub const LOAD_PERCENT: &str = "load_percent";

/// A single value in an open property set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Numeric view of the value. Text and bools have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }
}

/// An ordered, open key/value property set.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A character as seen by games and caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterInfo {
    pub id: CharacterId,
    pub account_id: AccountId,
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

impl CharacterInfo {
    pub fn new(id: CharacterId, account_id: AccountId, name: impl Into<String>) -> Self {
        Self {
            id,
            account_id,
            name: name.into(),
            properties: Properties::new(),
        }
    }

    /// Reported load progress, `0.0` when never reported.
    pub fn load_percent(&self) -> f64 {
        self.properties
            .get(LOAD_PERCENT)
            .and_then(PropertyValue::as_f64)
            .unwrap_or(0.0)
    }
}

/// Options a client supplies when asking Central to create a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameOptions {
    pub name: String,
    /// Players needed before the owner may start the game.
    pub min_players: usize,
    pub max_players: usize,
    pub allow_observers: bool,
    /// Observer cap; `0` means unlimited when observers are allowed.
    pub max_observers: usize,
    pub properties: Properties,
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            min_players: 1,
            max_players: 8,
            allow_observers: true,
            max_observers: 0,
            properties: Properties::new(),
        }
    }
}

impl GameOptions {
    /// Convenience for the common "just cap the seats" request.
    pub fn with_max_players(max_players: usize) -> Self {
        Self {
            max_players,
            ..Self::default()
        }
    }

    /// Checks the options are internally consistent.
    pub fn check(&self) -> Result<(), String> {
        if self.max_players == 0 {
            return Err("max_players must be at least 1".into());
        }
        if self.min_players > self.max_players {
            return Err(format!(
                "min_players ({}) exceeds max_players ({})",
                self.min_players, self.max_players
            ));
        }
        Ok(())
    }
}

/// Lifecycle slot of a game. Whether it has ended is tracked separately,
/// because a game can be abandoned in either slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GameState {
    #[default]
    Lobby,
    Started,
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lobby => write!(f, "Lobby"),
            Self::Started => write!(f, "Started"),
        }
    }
}

/// Central's provisional record of a game, persisted so the target Content
/// server can instantiate it on first admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDescriptor {
    pub game_id: GameId,
    pub target_server: String,
    pub options: GameOptions,
    /// Character that requested creation; becomes the game owner.
    pub owner: CharacterId,
}

/// One row of a game listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameListEntry {
    pub game_id: GameId,
    pub name: String,
    pub target_server: String,
    pub state: GameState,
    pub player_count: usize,
    pub max_players: usize,
    pub observer_count: usize,
    #[serde(default)]
    pub ended: bool,
}

impl GameListEntry {
    /// Lobby, not ended, and with a free seat.
    pub fn is_joinable(&self) -> bool {
        !self.ended && self.state == GameState::Lobby && self.player_count < self.max_players
    }
}

/// Full game state sent to a participant on admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: GameId,
    pub owner: CharacterId,
    pub options: GameOptions,
    pub state: GameState,
    pub solved: bool,
    pub ended: bool,
    pub players: Vec<CharacterInfo>,
    pub observers: Vec<CharacterInfo>,
    pub properties: Properties,
    pub messages: Vec<String>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

/// Where a client should go next after a Central decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub name: String,
    pub address: String,
}
