//! Client-side session driver.
//!
//! [`GameClient`] logs in to Central, asks for a placement, follows the
//! ticket to the Content server Central picked and waits there until its
//! own join is confirmed. Requests are correlated through reply handlers;
//! everything the servers push is published as [`ClientEvent`]s and
//! mirrored into a local [`Game`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use waypoint_game::{Game, GameConfig};
use waypoint_protocol::{
    ChannelLink, CharacterId, CharacterInfo, ConnectionId, DispatchTable, GameId, GameListEntry,
    GameOptions, Handler, HandlerResult, Packet, PacketLink, PacketType, Payload, ProtocolError,
    ServerAddress, Subtype, named_handler,
};
use waypoint_session::{Subscribers, SubscriptionId};

use crate::WaypointError;
use crate::node::Node;
use crate::worker::{self, Conduit, Inbound};

/// Reason used when the client itself hangs up.
pub const REASON_CLIENT_DISCONNECT: &str = "client disconnected";

/// Reason used when the client drops a Content link to follow a new ticket.
const REASON_FOLLOW: &str = "following ticket elsewhere";

/// Opens connections to servers by address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, server: &ServerAddress) -> Result<Conduit, WaypointError>;
}

/// Connects to nodes running in this process, looked up by name.
pub struct LocalConnector {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    next_port: AtomicU16,
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_port: AtomicU16::new(1),
        }
    }
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, node: Arc<Node>) {
        self.nodes
            .write()
            .await
            .insert(node.name().to_lowercase(), node);
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, server: &ServerAddress) -> Result<Conduit, WaypointError> {
        let node = self
            .nodes
            .read()
            .await
            .get(&server.name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                WaypointError::Disconnected(format!("no route to {}", server.name))
            })?;
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        node.open_local(SocketAddr::from(([127, 0, 0, 1], 40_000 + port)))
            .await
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a request or an admission may stay unanswered.
    pub request_timeout: Duration,
    /// Settings for the local game mirror.
    pub game: GameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            game: GameConfig::default(),
        }
    }
}

/// What a [`GameClient`] observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Central placed a new game on `server`.
    CentralCreationResolved { game_id: GameId, server: ServerAddress },
    /// The Content server instantiated the game with this client as owner.
    ContentCreationResolved { game_id: GameId, owner: CharacterId },
    JoinResolved { game_id: GameId, as_observer: bool },
    JoinRejected { message: String },
    PlayerJoined { game_id: GameId, player: CharacterInfo },
    PlayerLeft { game_id: GameId, character_id: CharacterId },
    ObserverJoined { game_id: GameId, observer: CharacterInfo },
    ObserverRemoved { game_id: GameId, character_id: CharacterId },
    LeaveResolved { game_id: GameId },
    StartGameReply { accepted: bool, message: String },
    GameStarted { game_id: GameId },
    GameEnded { game_id: GameId, solved: bool },
    Chat { game_id: GameId, from: CharacterId, text: String },
    ConnectionConcluded { server: String, reason: String },
}

type JoinWaiter = oneshot::Sender<Result<bool, String>>;

/// State every server link of one client shares.
struct ClientShared {
    config: ClientConfig,
    events: Subscribers<ClientEvent>,
    mirror: RwLock<Option<Arc<Game>>>,
    character: RwLock<CharacterId>,
    join_waiter: Mutex<Option<JoinWaiter>>,
    content_conn: Mutex<Option<ConnectionId>>,
    next_request: AtomicU64,
}

impl ClientShared {
    async fn me(&self) -> CharacterId {
        *self.character.read().await
    }

    async fn mirror(&self) -> Option<Arc<Game>> {
        self.mirror.read().await.clone()
    }

    async fn resolve_join(&self, result: Result<bool, String>) {
        if let Some(waiter) = self.join_waiter.lock().await.take() {
            let _ = waiter.send(result);
        }
    }
}

/// One connection from the client to a server.
struct ServerLink {
    server: ServerAddress,
    channel: Arc<ChannelLink>,
    link: Arc<dyn PacketLink>,
    shared: Arc<ClientShared>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Packet>>>,
    table: DispatchTable<ServerLink>,
}

impl ServerLink {
    async fn open(
        server: ServerAddress,
        conduit: Conduit,
        shared: Arc<ClientShared>,
    ) -> Arc<ServerLink> {
        let table = DispatchTable::new();
        let reply = named_handler("client::reply", on_reply);
        for (kind, subtype) in [
            (PacketType::Login, Subtype::Login),
            (PacketType::Generic, Subtype::RequestGameListing),
            (PacketType::Generic, Subtype::RequestCreateGame),
            (PacketType::Generic, Subtype::RequestQuickMatch),
            (PacketType::Generic, Subtype::RequestJoinGame),
            (PacketType::Generic, Subtype::RequestStartGame),
        ] {
            table.register_reply(kind, subtype, Arc::clone(&reply)).await;
        }
        for (kind, subtype, h) in notification_routes() {
            table.register(kind, subtype, h).await;
        }

        let channel = conduit.link;
        let link: Arc<dyn PacketLink> = Arc::clone(&channel) as Arc<dyn PacketLink>;
        let server_link = Arc::new(ServerLink {
            server,
            channel,
            link,
            shared,
            pending: Mutex::new(HashMap::new()),
            table,
        });
        tokio::spawn(worker::run(
            Arc::clone(&server_link),
            conduit.inbound,
            false,
        ));
        server_link
    }

    fn closed(&self) -> WaypointError {
        WaypointError::Disconnected(format!("link to {} closed", self.server.name))
    }

    /// Sends `payload` as a request and waits for its reply.
    async fn request(&self, payload: Payload, what: &str) -> Result<Packet, WaypointError> {
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if !self
            .link
            .send(Packet::request(payload.default_type(), id, payload))
        {
            self.pending.lock().await.remove(&id);
            return Err(self.closed());
        }
        match tokio::time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(WaypointError::Timeout(what.to_string()))
            }
        }
    }

    fn notify(&self, payload: Payload) -> Result<(), WaypointError> {
        if self.link.send(Packet::from(payload)) {
            Ok(())
        } else {
            Err(self.closed())
        }
    }

    /// Presents the ticket stored for `account_name`.
    async fn log_in(&self, account_name: &str) -> Result<CharacterId, WaypointError> {
        let reply = self
            .request(
                Payload::Login {
                    account_name: account_name.to_string(),
                },
                "login",
            )
            .await?;
        match reply.payload {
            Payload::LoginResult {
                accepted: true,
                character_id,
                ..
            } => Ok(character_id),
            Payload::LoginResult { message, .. } => Err(WaypointError::Rejected(message)),
            other => Err(unexpected_reply(&other)),
        }
    }
}

fn unexpected_reply(payload: &Payload) -> WaypointError {
    ProtocolError::InvalidPacket(format!("unexpected reply {:?}", payload.subtype())).into()
}

#[async_trait]
impl Inbound for ServerLink {
    fn link(&self) -> &Arc<dyn PacketLink> {
        &self.link
    }

    async fn route(self: Arc<Self>, packet: Packet) {
        let link = Arc::clone(&self.link);
        self.table
            .dispatch(Arc::clone(&self), link.as_ref(), packet)
            .await;
    }

    async fn concluded(self: Arc<Self>, reason: String) {
        let reason = match self.channel.kill_reason() {
            Some(own) => own.to_string(),
            None => reason,
        };
        self.channel.kill(&reason);
        self.pending.lock().await.clear();

        let was_content = {
            let mut content_conn = self.shared.content_conn.lock().await;
            let hit = *content_conn == Some(self.link.id());
            if hit {
                *content_conn = None;
            }
            hit
        };
        if was_content {
            self.shared.resolve_join(Err(reason.clone())).await;
        }
        info!(server = %self.server.name, %reason, "server connection concluded");
        self.shared
            .events
            .publish(ClientEvent::ConnectionConcluded {
                server: self.server.name.clone(),
                reason,
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn on_reply(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    match &packet.payload {
        Payload::CreateGameResult {
            accepted: true,
            game: Some(game),
            server: Some(server),
            ..
        } => {
            link.shared
                .events
                .publish(ClientEvent::CentralCreationResolved {
                    game_id: game.game_id,
                    server: server.clone(),
                })
                .await;
        }
        Payload::StartGameReply { accepted, message } => {
            link.shared
                .events
                .publish(ClientEvent::StartGameReply {
                    accepted: *accepted,
                    message: message.clone(),
                })
                .await;
        }
        _ => {}
    }

    match link.pending.lock().await.remove(&packet.request_id) {
        Some(waiter) => {
            let _ = waiter.send(packet);
        }
        None => debug!(
            server = %link.server.name,
            request_id = packet.request_id,
            "reply for a request nobody waits on"
        ),
    }
    Ok(())
}

fn notification_routes() -> Vec<(PacketType, Subtype, Handler<ServerLink>)> {
    vec![
        (
            PacketType::Generic,
            Subtype::GameCreated,
            named_handler("client::game_created", on_game_created),
        ),
        (
            PacketType::Generic,
            Subtype::GameSnapshot,
            named_handler("client::game_snapshot", on_game_snapshot),
        ),
        (
            PacketType::Generic,
            Subtype::PlayerJoined,
            named_handler("client::player_joined", on_player_joined),
        ),
        (
            PacketType::Generic,
            Subtype::ObserverJoined,
            named_handler("client::observer_joined", on_observer_joined),
        ),
        (
            PacketType::Generic,
            Subtype::PlayerLeft,
            named_handler("client::player_left", on_member_left),
        ),
        (
            PacketType::Generic,
            Subtype::ObserverRemoved,
            named_handler("client::observer_removed", on_member_left),
        ),
        (
            PacketType::Generic,
            Subtype::GameStarted,
            named_handler("client::game_started", on_game_started),
        ),
        (
            PacketType::Generic,
            Subtype::GameEnded,
            named_handler("client::game_ended", on_game_ended),
        ),
        (
            PacketType::Match,
            Subtype::ChatMessage,
            named_handler("client::chat", on_chat_message),
        ),
        (
            PacketType::Generic,
            Subtype::JoinGameResult,
            named_handler("client::join_rejected", on_join_rejected),
        ),
        (
            PacketType::Generic,
            Subtype::Disconnect,
            named_handler("client::disconnect", on_disconnect),
        ),
    ]
}

async fn on_game_created(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    if let Payload::GameCreated { game_id, owner } = packet.payload {
        link.shared
            .events
            .publish(ClientEvent::ContentCreationResolved { game_id, owner })
            .await;
    }
    Ok(())
}

async fn on_game_snapshot(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    if let Payload::GameSnapshot { snapshot } = packet.payload {
        let game = Game::from_snapshot(snapshot, &link.shared.config.game);
        debug!(game_id = %game.id(), "game mirror rebuilt");
        *link.shared.mirror.write().await = Some(Arc::new(game));
    }
    Ok(())
}

async fn on_player_joined(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    let Payload::PlayerJoined { game_id, player } = packet.payload else {
        return Ok(());
    };
    member_joined(&link, game_id, player, false).await;
    Ok(())
}

async fn on_observer_joined(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    let Payload::ObserverJoined { game_id, observer } = packet.payload else {
        return Ok(());
    };
    member_joined(&link, game_id, observer, true).await;
    Ok(())
}

async fn member_joined(link: &ServerLink, game_id: GameId, member: CharacterInfo, as_observer: bool) {
    let shared = &link.shared;
    if member.id == shared.me().await {
        shared.resolve_join(Ok(as_observer)).await;
        shared
            .events
            .publish(ClientEvent::JoinResolved {
                game_id,
                as_observer,
            })
            .await;
        return;
    }

    if let Some(game) = shared.mirror().await {
        let viewer = Some(shared.me().await);
        if let Err(e) = game.admit_player(member.clone(), as_observer, viewer).await {
            debug!(%game_id, character = %member.id, error = %e, "mirror already has member");
        }
    }
    let event = if as_observer {
        ClientEvent::ObserverJoined {
            game_id,
            observer: member,
        }
    } else {
        ClientEvent::PlayerJoined {
            game_id,
            player: member,
        }
    };
    shared.events.publish(event).await;
}

async fn on_member_left(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    let (game_id, character_id, was_observer) = match packet.payload {
        Payload::PlayerLeft {
            game_id,
            character_id,
        } => (game_id, character_id, false),
        Payload::ObserverRemoved {
            game_id,
            character_id,
        } => (game_id, character_id, true),
        _ => return Ok(()),
    };
    let shared = &link.shared;

    if character_id == shared.me().await {
        *shared.mirror.write().await = None;
        shared
            .events
            .publish(ClientEvent::LeaveResolved { game_id })
            .await;
        return Ok(());
    }

    if let Some(game) = shared.mirror().await {
        game.remove_member(character_id).await;
    }
    let event = if was_observer {
        ClientEvent::ObserverRemoved {
            game_id,
            character_id,
        }
    } else {
        ClientEvent::PlayerLeft {
            game_id,
            character_id,
        }
    };
    shared.events.publish(event).await;
    Ok(())
}

async fn on_game_started(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    let Payload::GameStarted { game_id } = packet.payload else {
        return Ok(());
    };
    if let Some(game) = link.shared.mirror().await {
        if let Err(e) = game.start().await {
            debug!(%game_id, error = %e, "mirror not startable");
        }
    }
    link.shared
        .events
        .publish(ClientEvent::GameStarted { game_id })
        .await;
    Ok(())
}

async fn on_game_ended(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    let Payload::GameEnded { game_id, solved } = packet.payload else {
        return Ok(());
    };
    if let Some(game) = link.shared.mirror().await {
        game.conclude(solved).await;
    }
    link.shared
        .events
        .publish(ClientEvent::GameEnded { game_id, solved })
        .await;
    Ok(())
}

async fn on_chat_message(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    let Payload::ChatMessage {
        game_id,
        from,
        text,
    } = packet.payload
    else {
        return Ok(());
    };
    if let Some(game) = link.shared.mirror().await {
        let name = match game.player(from).await {
            Some(player) => player.name,
            None => from.to_string(),
        };
        game.post_message(format!("{name}: {text}")).await;
    }
    link.shared
        .events
        .publish(ClientEvent::Chat {
            game_id,
            from,
            text,
        })
        .await;
    Ok(())
}

async fn on_join_rejected(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    if let Payload::JoinGameResult {
        accepted: false,
        message,
        ..
    } = packet.payload
    {
        warn!(server = %link.server.name, %message, "join rejected");
        link.shared.resolve_join(Err(message.clone())).await;
        link.shared
            .events
            .publish(ClientEvent::JoinRejected { message })
            .await;
    }
    Ok(())
}

async fn on_disconnect(link: Arc<ServerLink>, packet: Packet) -> HandlerResult {
    if let Payload::Disconnect { reason } = &packet.payload {
        link.channel.kill(reason);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GameClient
// ---------------------------------------------------------------------------

/// Drives one account through Central and into games.
pub struct GameClient {
    account_name: String,
    connector: Arc<dyn Connector>,
    shared: Arc<ClientShared>,
    central: Mutex<Option<Arc<ServerLink>>>,
    content: Mutex<Option<Arc<ServerLink>>>,
}

impl GameClient {
    pub fn new(
        account_name: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            connector,
            shared: Arc::new(ClientShared {
                config,
                events: Subscribers::new(),
                mirror: RwLock::new(None),
                character: RwLock::new(CharacterId::NONE),
                join_waiter: Mutex::new(None),
                content_conn: Mutex::new(None),
                next_request: AtomicU64::new(1),
            }),
            central: Mutex::new(None),
            content: Mutex::new(None),
        }
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub async fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ClientEvent>) {
        self.shared.events.subscribe().await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id).await
    }

    /// Character Central reported at login.
    pub async fn character_id(&self) -> CharacterId {
        self.shared.me().await
    }

    /// Local mirror of the game this client is in.
    pub async fn game(&self) -> Option<Arc<Game>> {
        self.shared.mirror().await
    }

    async fn open(&self, server: &ServerAddress) -> Result<Arc<ServerLink>, WaypointError> {
        let conduit = self.connector.connect(server).await?;
        Ok(ServerLink::open(server.clone(), conduit, Arc::clone(&self.shared)).await)
    }

    async fn central_link(&self) -> Result<Arc<ServerLink>, WaypointError> {
        self.central
            .lock()
            .await
            .clone()
            .ok_or_else(|| WaypointError::NotReady("not connected to central".into()))
    }

    async fn content_link(&self) -> Result<Arc<ServerLink>, WaypointError> {
        self.content
            .lock()
            .await
            .clone()
            .ok_or_else(|| WaypointError::NotReady("not in a game".into()))
    }

    /// Connects to Central and logs in with the account's stored ticket.
    pub async fn connect_central(&self, central: ServerAddress) -> Result<CharacterId, WaypointError> {
        let link = self.open(&central).await?;
        let character = match link.log_in(&self.account_name).await {
            Ok(character) => character,
            Err(e) => {
                link.channel.kill(REASON_CLIENT_DISCONNECT);
                return Err(e);
            }
        };
        *self.shared.character.write().await = character;
        if let Some(old) = self.central.lock().await.replace(link) {
            old.channel.kill(REASON_CLIENT_DISCONNECT);
        }
        info!(account = %self.account_name, server = %central.name, %character, "logged in to central");
        Ok(character)
    }

    pub async fn list_games(&self) -> Result<Vec<GameListEntry>, WaypointError> {
        let reply = self
            .central_link()
            .await?
            .request(Payload::RequestGameListing, "game listing")
            .await?;
        match reply.payload {
            Payload::GameListing { games } => Ok(games),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Asks Central for a new game and follows the ticket into it.
    pub async fn create_game(&self, options: GameOptions) -> Result<GameId, WaypointError> {
        let reply = self
            .central_link()
            .await?
            .request(Payload::RequestCreateGame { options }, "game creation")
            .await?;
        let (game_id, server) = placement(reply.payload)?;
        self.follow(server, game_id).await?;
        Ok(game_id)
    }

    /// Joins an existing game. Returns whether it was joined as an observer.
    pub async fn join_game(&self, game_id: GameId, as_observer: bool) -> Result<bool, WaypointError> {
        let reply = self
            .central_link()
            .await?
            .request(
                Payload::RequestJoinGame {
                    game_id,
                    as_observer,
                },
                "join",
            )
            .await?;
        let (game_id, server) = placement(reply.payload)?;
        self.follow(server, game_id).await
    }

    /// Lets Central pick (or create) a game.
    pub async fn quick_match(&self) -> Result<GameId, WaypointError> {
        let reply = self
            .central_link()
            .await?
            .request(Payload::RequestQuickMatch, "quick match")
            .await?;
        let (game_id, server) = placement(reply.payload)?;
        self.follow(server, game_id).await?;
        Ok(game_id)
    }

    /// Drops any current Content link, connects to `server` and waits until
    /// the character is admitted to `game_id`.
    async fn follow(&self, server: ServerAddress, game_id: GameId) -> Result<bool, WaypointError> {
        *self.shared.content_conn.lock().await = None;
        let (tx, rx) = oneshot::channel();
        *self.shared.join_waiter.lock().await = Some(tx);
        if let Some(old) = self.content.lock().await.take() {
            old.channel.kill(REASON_FOLLOW);
        }
        *self.shared.mirror.write().await = None;

        let link = self.open(&server).await?;
        *self.shared.content_conn.lock().await = Some(link.link.id());
        *self.content.lock().await = Some(Arc::clone(&link));
        debug!(account = %self.account_name, server = %server.name, %game_id, "following ticket");
        link.log_in(&self.account_name).await?;

        match tokio::time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(Ok(as_observer))) => Ok(as_observer),
            Ok(Ok(Err(message))) => Err(WaypointError::Rejected(message)),
            Ok(Err(_)) => Err(link.closed()),
            Err(_) => Err(WaypointError::Timeout(format!("admission to {game_id}"))),
        }
    }

    /// Asks the Content server to start the game.
    pub async fn request_start(&self) -> Result<(bool, String), WaypointError> {
        let reply = self
            .content_link()
            .await?
            .request(Payload::RequestStartGame, "start reply")
            .await?;
        match reply.payload {
            Payload::StartGameReply { accepted, message } => Ok((accepted, message)),
            other => Err(unexpected_reply(&other)),
        }
    }

    pub async fn report_load(&self, percent: f64) -> Result<(), WaypointError> {
        self.content_link()
            .await?
            .notify(Payload::LoadProgress { percent })
    }

    pub async fn chat(&self, text: impl Into<String>) -> Result<(), WaypointError> {
        self.content_link()
            .await?
            .notify(Payload::Chat { text: text.into() })
    }

    pub async fn conclude(&self, solved: bool) -> Result<(), WaypointError> {
        self.content_link()
            .await?
            .notify(Payload::ConcludeGame { solved })
    }

    pub async fn leave_game(&self) -> Result<(), WaypointError> {
        self.content_link().await?.notify(Payload::LeaveGame)
    }

    /// Renews the session on every connected server.
    pub async fn keep_alive(&self) -> Result<(), WaypointError> {
        let links: Vec<Arc<ServerLink>> = [
            self.central.lock().await.clone(),
            self.content.lock().await.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if links.is_empty() {
            return Err(WaypointError::NotReady("not connected".into()));
        }
        for link in links {
            link.notify(Payload::KeepAlive)?;
        }
        Ok(())
    }

    /// Hangs up every server link.
    pub async fn disconnect(&self) {
        for slot in [&self.central, &self.content] {
            if let Some(link) = slot.lock().await.take() {
                link.channel.kill(REASON_CLIENT_DISCONNECT);
            }
        }
    }
}

/// The game and server out of a Central placement reply.
fn placement(payload: Payload) -> Result<(GameId, ServerAddress), WaypointError> {
    match payload {
        Payload::CreateGameResult {
            accepted: true,
            game: Some(game),
            server: Some(server),
            ..
        } => Ok((game.game_id, server)),
        Payload::JoinGameResult {
            accepted: true,
            game_id: Some(game_id),
            server: Some(server),
            ..
        } => Ok((game_id, server)),
        Payload::CreateGameResult { message, .. } | Payload::JoinGameResult { message, .. } => {
            Err(WaypointError::Rejected(message))
        }
        other => Err(unexpected_reply(&other)),
    }
}
