//! Packets: the unit every node sends and dispatches.
//!
//! A packet carries a [`PacketType`] (coarse channel), a [`Payload`] (the
//! closed set of messages this protocol speaks) and, for replies, a
//! [`PacketRef`] naming the request it answers. The dispatch key of a
//! packet is `(PacketType, Subtype)`, where [`Subtype`] is the payload's
//! discriminant.

use serde::{Deserialize, Serialize};

use crate::{
    AccountId, AuthorizationTicket, CharacterId, CharacterInfo, GameDescriptor, GameId, GameListEntry, GameOptions,
    GameSnapshot, ServerAddress,
};

/// Coarse packet channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Requests, replies and notifications between a client and a node.
    Generic,
    /// Ticket presentation and its result.
    Login,
    /// In-match traffic routed to a live game.
    Match,
    /// Node-to-node traffic over a parent link.
    Cluster,
}

/// Discriminant of a [`Payload`]; together with [`PacketType`] it forms the
/// dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subtype {
    Login,
    LoginResult,
    KeepAlive,
    Disconnect,
    RequestGameListing,
    GameListing,
    RequestCreateGame,
    CreateGameResult,
    RequestQuickMatch,
    RequestJoinGame,
    JoinGameResult,
    GameCreated,
    GameSnapshot,
    PlayerJoined,
    PlayerLeft,
    ObserverJoined,
    ObserverRemoved,
    RequestStartGame,
    StartGameReply,
    LoadProgress,
    GameStarted,
    Chat,
    ChatMessage,
    ConcludeGame,
    GameEnded,
    LeaveGame,
    ServerHello,
    GameStatus,
    GameRemoved,
    SessionHandoff,
}

/// Every message the protocol can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    // -- session --
    /// Client → node: present the ticket issued for `account_name`.
    Login { account_name: String },
    LoginResult {
        accepted: bool,
        message: String,
        account_id: Option<AccountId>,
        character_id: CharacterId,
    },
    /// Renews the session's ticket and the active character's cache entry.
    KeepAlive,
    /// Node → client: the connection is being terminated.
    Disconnect { reason: String },

    // -- central --
    RequestGameListing,
    GameListing { games: Vec<GameListEntry> },
    RequestCreateGame { options: GameOptions },
    /// Central half of creation: the game is provisional until Content
    /// instantiates it.
    CreateGameResult {
        accepted: bool,
        message: String,
        game: Option<GameDescriptor>,
        server: Option<ServerAddress>,
    },
    RequestQuickMatch,
    RequestJoinGame { game_id: GameId, as_observer: bool },
    JoinGameResult {
        accepted: bool,
        message: String,
        game_id: Option<GameId>,
        server: Option<ServerAddress>,
    },

    // -- content --
    /// Content half of creation: the game now exists on this server.
    GameCreated { game_id: GameId, owner: CharacterId },
    GameSnapshot { snapshot: GameSnapshot },
    PlayerJoined { game_id: GameId, player: CharacterInfo },
    PlayerLeft { game_id: GameId, character_id: CharacterId },
    ObserverJoined { game_id: GameId, observer: CharacterInfo },
    ObserverRemoved { game_id: GameId, character_id: CharacterId },
    RequestStartGame,
    StartGameReply { accepted: bool, message: String },
    LoadProgress { percent: f64 },
    GameStarted { game_id: GameId },
    Chat { text: String },
    ChatMessage { game_id: GameId, from: CharacterId, text: String },
    ConcludeGame { solved: bool },
    GameEnded { game_id: GameId, solved: bool },
    LeaveGame,

    // -- cluster --
    /// Content → Central: announce this node on a parent link.
    ServerHello {
        name: String,
        address: String,
        max_games: usize,
        /// Shared cluster secret.
        #[serde(default)]
        secret: String,
    },
    GameStatus { entry: GameListEntry },
    GameRemoved { game_id: GameId },
    /// Central → Content: pre-register a session for a client that is on
    /// its way (assisted transfer). Carries the character and game
    /// descriptor so the target needs no store round-trip for either.
    SessionHandoff {
        ticket: AuthorizationTicket,
        #[serde(default)]
        character: Option<CharacterInfo>,
        #[serde(default)]
        game: Option<GameDescriptor>,
    },
}

impl Payload {
    /// The dispatch subtype of this payload.
    pub fn subtype(&self) -> Subtype {
        match self {
            Self::Login { .. } => Subtype::Login,
            Self::LoginResult { .. } => Subtype::LoginResult,
            Self::KeepAlive => Subtype::KeepAlive,
            Self::Disconnect { .. } => Subtype::Disconnect,
            Self::RequestGameListing => Subtype::RequestGameListing,
            Self::GameListing { .. } => Subtype::GameListing,
            Self::RequestCreateGame { .. } => Subtype::RequestCreateGame,
            Self::CreateGameResult { .. } => Subtype::CreateGameResult,
            Self::RequestQuickMatch => Subtype::RequestQuickMatch,
            Self::RequestJoinGame { .. } => Subtype::RequestJoinGame,
            Self::JoinGameResult { .. } => Subtype::JoinGameResult,
            Self::GameCreated { .. } => Subtype::GameCreated,
            Self::GameSnapshot { .. } => Subtype::GameSnapshot,
            Self::PlayerJoined { .. } => Subtype::PlayerJoined,
            Self::PlayerLeft { .. } => Subtype::PlayerLeft,
            Self::ObserverJoined { .. } => Subtype::ObserverJoined,
            Self::ObserverRemoved { .. } => Subtype::ObserverRemoved,
            Self::RequestStartGame => Subtype::RequestStartGame,
            Self::StartGameReply { .. } => Subtype::StartGameReply,
            Self::LoadProgress { .. } => Subtype::LoadProgress,
            Self::GameStarted { .. } => Subtype::GameStarted,
            Self::Chat { .. } => Subtype::Chat,
            Self::ChatMessage { .. } => Subtype::ChatMessage,
            Self::ConcludeGame { .. } => Subtype::ConcludeGame,
            Self::GameEnded { .. } => Subtype::GameEnded,
            Self::LeaveGame => Subtype::LeaveGame,
            Self::ServerHello { .. } => Subtype::ServerHello,
            Self::GameStatus { .. } => Subtype::GameStatus,
            Self::GameRemoved { .. } => Subtype::GameRemoved,
            Self::SessionHandoff { .. } => Subtype::SessionHandoff,
        }
    }

    /// The channel this payload travels on unless the sender says otherwise.
    pub fn default_type(&self) -> PacketType {
        match self {
            Self::Login { .. } | Self::LoginResult { .. } => PacketType::Login,
            Self::LoadProgress { .. }
            | Self::Chat { .. }
            | Self::ChatMessage { .. }
            | Self::ConcludeGame { .. } => PacketType::Match,
            Self::ServerHello { .. }
            | Self::GameStatus { .. }
            | Self::GameRemoved { .. }
            | Self::SessionHandoff { .. } => PacketType::Cluster,
            _ => PacketType::Generic,
        }
    }
}

/// Names the request a reply answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketRef {
    pub kind: PacketType,
    pub subtype: Subtype,
    pub request_id: u64,
}

/// A typed packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketType,
    /// Sender-chosen correlation id; `0` for notifications.
    #[serde(default)]
    pub request_id: u64,
    /// Set only on replies.
    #[serde(default)]
    pub reply_to: Option<PacketRef>,
    pub payload: Payload,
}

impl Packet {
    pub fn new(kind: PacketType, payload: Payload) -> Self {
        Self {
            kind,
            request_id: 0,
            reply_to: None,
            payload,
        }
    }

    /// Builds a request carrying `request_id` for later correlation.
    pub fn request(kind: PacketType, request_id: u64, payload: Payload) -> Self {
        Self {
            kind,
            request_id,
            reply_to: None,
            payload,
        }
    }

    /// Builds a reply to `request`. The reply travels on the request's
    /// channel so both ends agree on the correlation key.
    pub fn reply_to(request: &Packet, payload: Payload) -> Self {
        Self {
            kind: request.kind,
            request_id: request.request_id,
            reply_to: Some(request.to_ref()),
            payload,
        }
    }

    pub fn subtype(&self) -> Subtype {
        self.payload.subtype()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Reference to this packet, used as a reply's `reply_to`.
    pub fn to_ref(&self) -> PacketRef {
        PacketRef {
            kind: self.kind,
            subtype: self.subtype(),
            request_id: self.request_id,
        }
    }
}

impl From<Payload> for Packet {
    fn from(payload: Payload) -> Self {
        Self::new(payload.default_type(), payload)
    }
}
