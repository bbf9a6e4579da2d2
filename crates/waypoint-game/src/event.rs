//! Events a game publishes to its observer list.

use waypoint_protocol::{CharacterId, CharacterInfo, GameId};

#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    PlayerJoined { game_id: GameId, player: CharacterInfo },
    PlayerLeft { game_id: GameId, character_id: CharacterId },
    ObserverJoined { game_id: GameId, observer: CharacterInfo },
    ObserverRemoved { game_id: GameId, character_id: CharacterId },
    OwnerChanged { game_id: GameId, owner: CharacterId },
    Started { game_id: GameId },
    Ended { game_id: GameId, solved: bool },
    /// Membership dropped to zero before a solved conclusion.
    Abandoned { game_id: GameId },
    Message { game_id: GameId, line: String },
}

impl GameEvent {
    pub fn game_id(&self) -> GameId {
        match self {
            Self::PlayerJoined { game_id, .. }
            | Self::PlayerLeft { game_id, .. }
            | Self::ObserverJoined { game_id, .. }
            | Self::ObserverRemoved { game_id, .. }
            | Self::OwnerChanged { game_id, .. }
            | Self::Started { game_id }
            | Self::Ended { game_id, .. }
            | Self::Abandoned { game_id }
            | Self::Message { game_id, .. } => *game_id,
        }
    }

    /// Whether the event changes what a listing row shows.
    pub fn changes_listing(&self) -> bool {
        !matches!(self, Self::Message { .. } | Self::OwnerChanged { .. })
    }
}
