//! Live games hosted by one node, and the purge policy.
//!
//! A game leaves the directory when it is
//!
//! - ended and drained of players, or
//! - abandoned for longer than its phase's purge window
//!   (`abandoned_lobby_purge` before start, `abandoned_started_purge`
//!   after). Such a game is concluded unsolved before removal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;
use waypoint_protocol::{GameDescriptor, GameId, GameListEntry, GameOptions};

use crate::{Game, GameConfig, GameError};

/// Why [`GameDirectory::purge_at`] removed a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeReason {
    /// Ended and no players left.
    Drained,
    /// Abandoned past its purge window.
    Abandoned,
}

pub struct PurgedGame {
    pub game: Arc<Game>,
    pub reason: PurgeReason,
}

pub struct GameDirectory {
    config: GameConfig,
    games: RwLock<HashMap<GameId, Arc<Game>>>,
}

impl GameDirectory {
    pub fn new(config: GameConfig) -> Self {
        Self {
            config: config.validated(),
            games: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// # Errors
    /// [`GameError::AlreadyExists`] if `id` is taken.
    pub async fn create(&self, id: GameId, options: GameOptions) -> Result<Arc<Game>, GameError> {
        let mut games = self.games.write().await;
        if games.contains_key(&id) {
            return Err(GameError::AlreadyExists(id));
        }
        let game = Arc::new(Game::new(id, options, &self.config));
        games.insert(id, Arc::clone(&game));
        info!(game_id = %id, "game created");
        Ok(game)
    }

    /// Returns the live game for `descriptor`, instantiating it if needed.
    /// The flag is `true` when this call created it.
    pub async fn locate_or_instantiate(&self, descriptor: &GameDescriptor) -> (Arc<Game>, bool) {
        let mut games = self.games.write().await;
        if let Some(game) = games.get(&descriptor.game_id) {
            return (Arc::clone(game), false);
        }
        let game = Arc::new(Game::from_descriptor(descriptor, &self.config));
        games.insert(descriptor.game_id, Arc::clone(&game));
        info!(game_id = %descriptor.game_id, "game instantiated from descriptor");
        (game, true)
    }

    pub async fn get(&self, id: GameId) -> Option<Arc<Game>> {
        self.games.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: GameId) -> Option<Arc<Game>> {
        self.games.write().await.remove(&id)
    }

    /// Every live game, ordered by id.
    pub async fn games(&self) -> Vec<Arc<Game>> {
        let mut all: Vec<_> = self.games.read().await.values().cloned().collect();
        all.sort_by_key(|g| g.id());
        all
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }

    /// Listing rows for every game, stamped with `server`.
    pub async fn entries(&self, server: &str) -> Vec<GameListEntry> {
        let mut rows = Vec::new();
        for game in self.games().await {
            rows.push(game.list_entry(server).await);
        }
        rows
    }

    /// Lowest-id joinable lobby, if any.
    pub async fn find_quick_match(&self) -> Option<Arc<Game>> {
        for game in self.games().await {
            if game.list_entry("").await.is_joinable() {
                return Some(game);
            }
        }
        None
    }

    pub async fn purge(&self) -> Vec<PurgedGame> {
        self.purge_at(Utc::now()).await
    }

    /// Applies the purge policy as of `now`.
    pub async fn purge_at(&self, now: DateTime<Utc>) -> Vec<PurgedGame> {
        let mut games = self.games.write().await;
        let mut doomed = Vec::new();
        for (id, game) in games.iter() {
            if game.is_ended().await && game.player_count().await == 0 {
                doomed.push((*id, PurgeReason::Drained));
                continue;
            }
            if let Some(since) = game.abandoned_at().await {
                let window = self.config.purge_window(game.is_started().await);
                if now - since > window {
                    doomed.push((*id, PurgeReason::Abandoned));
                }
            }
        }

        let mut purged = Vec::with_capacity(doomed.len());
        for (id, reason) in doomed {
            if let Some(game) = games.remove(&id) {
                if reason == PurgeReason::Abandoned {
                    game.conclude(false).await;
                }
                game.set_shutting_down().await;
                info!(game_id = %id, ?reason, "game purged");
                purged.push(PurgedGame { game, reason });
            }
        }
        purged
    }
}
