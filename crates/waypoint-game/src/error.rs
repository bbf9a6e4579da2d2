//! Error types for the game layer.

use waypoint_protocol::{CharacterId, GameId};

/// Errors raised by game membership and lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("game {0} not found")]
    NotFound(GameId),

    #[error("game {0} already exists")]
    AlreadyExists(GameId),

    /// Every player seat is taken.
    #[error("game {game_id} is full ({max} players)")]
    Full { game_id: GameId, max: usize },

    #[error("game {0} does not allow observers")]
    ObserversNotAllowed(GameId),

    #[error("game {game_id} observer limit reached ({max})")]
    ObserversFull { game_id: GameId, max: usize },

    #[error("character {character} is already in game {game_id}")]
    AlreadyMember { game_id: GameId, character: CharacterId },

    #[error("character {character} is not in game {game_id}")]
    NotMember { game_id: GameId, character: CharacterId },

    /// Only the owner may do this.
    #[error("character {character} does not own game {game_id}")]
    NotOwner { game_id: GameId, character: CharacterId },

    #[error("game {game_id} needs {need} players, has {have}")]
    NotEnoughPlayers { game_id: GameId, have: usize, need: usize },

    #[error("game {0} has already started")]
    AlreadyStarted(GameId),

    #[error("game {0} has ended")]
    Ended(GameId),
}
