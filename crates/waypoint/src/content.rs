//! The Content server: hosts live games.
//!
//! A client arrives with a ticket naming the game Central placed it in.
//! After login the game is located (or instantiated from its descriptor)
//! and the character admitted. Every hosted game owns a dispatch table for
//! in-match traffic, a map of member links to broadcast on, and a
//! forwarder task that turns game events into packets for members and
//! status rows for the parent link.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};
use waypoint_game::{Game, GameDirectory, GameError, GameEvent};
use waypoint_protocol::{
    AuthorizationTicket, CharacterId, CharacterInfo, ConnectionId, DispatchTable, GameDescriptor,
    GameId, HandlerError, HandlerResult, Packet, PacketLink, PacketType, Payload, Subtype,
    named_handler,
};
use waypoint_session::{
    CacheLifetime, CharacterCache, ConnectionRegistry, DurableStore, SessionContext, SessionRecord,
    SessionRegistry, StoreError, SubscriptionId,
};

use crate::config::NodeConfig;
use crate::node::{Peer, Route};
use crate::session::unexpected;

/// Why a character could not be admitted.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("no active character")]
    NoCharacter,

    #[error("game {0} is not hosted on this server")]
    NotHosted(GameId),

    #[error("server at capacity ({0} games)")]
    AtCapacity(usize),

    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One live game plus everything needed to talk to its members.
pub struct HostedGame {
    game: Arc<Game>,
    table: DispatchTable<Peer>,
    members: Mutex<HashMap<CharacterId, Arc<dyn PacketLink>>>,
    admission: Mutex<()>,
    subscription: SubscriptionId,
}

impl HostedGame {
    pub fn game(&self) -> &Arc<Game> {
        &self.game
    }

    pub(crate) fn table(&self) -> &DispatchTable<Peer> {
        &self.table
    }

    /// Binds `character` to `link`, replacing any earlier binding.
    async fn bind(&self, character: CharacterId, link: Arc<dyn PacketLink>) {
        self.members.lock().await.insert(character, link);
    }

    /// Drops the binding only if it still points at `link`.
    async fn unbind(&self, character: CharacterId, link: ConnectionId) -> bool {
        let mut members = self.members.lock().await;
        match members.get(&character) {
            Some(bound) if bound.id() == link => {
                members.remove(&character);
                true
            }
            _ => false,
        }
    }

    /// Sends `payload` to every member except `skip`.
    async fn broadcast(&self, payload: &Payload, skip: Option<CharacterId>) -> usize {
        let links: Vec<Arc<dyn PacketLink>> = self
            .members
            .lock()
            .await
            .iter()
            .filter(|(id, _)| Some(**id) != skip)
            .map(|(_, link)| Arc::clone(link))
            .collect();
        links
            .iter()
            .filter(|link| link.send(Packet::from(payload.clone())))
            .count()
    }
}

pub struct Content {
    name: String,
    public_address: String,
    max_games: usize,
    games: GameDirectory,
    hosted: RwLock<HashMap<GameId, Arc<HostedGame>>>,
    handed_off: RwLock<HashMap<GameId, GameDescriptor>>,
    retired: RwLock<HashSet<GameId>>,
    game_routes: Vec<Route>,
    store: Arc<dyn DurableStore>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<CharacterCache>,
    connections: Arc<ConnectionRegistry>,
}

impl Content {
    pub(crate) fn new(
        config: &NodeConfig,
        store: Arc<dyn DurableStore>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<CharacterCache>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            name: config.node.name.clone(),
            public_address: config.public_address(),
            max_games: config.content.max_games,
            games: GameDirectory::new(config.game_config()),
            hosted: RwLock::new(HashMap::new()),
            handed_off: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashSet::new()),
            game_routes: game_routes(),
            store,
            sessions,
            cache,
            connections,
        }
    }

    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    pub fn max_games(&self) -> usize {
        self.max_games
    }

    pub fn games(&self) -> &GameDirectory {
        &self.games
    }

    pub async fn hosted(&self, game_id: GameId) -> Option<Arc<HostedGame>> {
        self.hosted.read().await.get(&game_id).cloned()
    }

    pub async fn hosted_count(&self) -> usize {
        self.hosted.read().await.len()
    }

    /// The hosted game, instantiating it from its descriptor on first use.
    async fn locate(&self, game_id: GameId) -> Result<Arc<HostedGame>, AdmissionError> {
        if let Some(hosted) = self.hosted(game_id).await {
            return Ok(hosted);
        }
        if self.retired.read().await.contains(&game_id) {
            return Err(GameError::Ended(game_id).into());
        }

        let handed_off = self.handed_off.read().await.get(&game_id).cloned();
        let descriptor = match handed_off {
            Some(descriptor) => descriptor,
            None => self
                .store
                .load_game_descriptor(game_id)
                .await?
                .ok_or(GameError::NotFound(game_id))?,
        };
        if !descriptor.target_server.eq_ignore_ascii_case(&self.name) {
            warn!(server = %self.name, %game_id, target = %descriptor.target_server, "ticket names a game hosted elsewhere");
            return Err(AdmissionError::NotHosted(game_id));
        }

        let (entry, events) = {
            let mut hosted = self.hosted.write().await;
            if let Some(existing) = hosted.get(&game_id) {
                return Ok(Arc::clone(existing));
            }
            if hosted.len() >= self.max_games {
                return Err(AdmissionError::AtCapacity(self.max_games));
            }

            let (game, created) = self.games.locate_or_instantiate(&descriptor).await;
            let (subscription, events) = game.subscribe().await;
            let table = DispatchTable::new();
            for (kind, subtype, h) in &self.game_routes {
                table.register(*kind, *subtype, Arc::clone(h)).await;
            }
            let entry = Arc::new(HostedGame {
                game,
                table,
                members: Mutex::new(HashMap::new()),
                admission: Mutex::new(()),
                subscription,
            });
            hosted.insert(game_id, Arc::clone(&entry));
            if created {
                info!(server = %self.name, %game_id, name = %descriptor.options.name, "game instantiated");
            }
            (entry, events)
        };

        tokio::spawn(forward(
            Arc::clone(&entry),
            events,
            self.name.clone(),
            Arc::clone(&self.connections),
        ));
        self.announce(&entry.game).await;
        Ok(entry)
    }

    /// Admits the logged-in character into the ticket's target game.
    /// Rejections are reported to the client, never raised.
    pub(crate) async fn admit(&self, peer: &Arc<Peer>, ctx: &SessionContext) {
        let Some(game_id) = ctx.ticket.target_game else {
            return;
        };
        if let Err(e) = self.try_admit(peer, ctx, game_id).await {
            warn!(
                server = %self.name,
                %game_id,
                character = %ctx.character_id(),
                error = %e,
                "admission rejected"
            );
            peer.send(Payload::JoinGameResult {
                accepted: false,
                message: format!("join rejected: {e}"),
                game_id: Some(game_id),
                server: None,
            });
        }
    }

    async fn try_admit(
        &self,
        peer: &Arc<Peer>,
        ctx: &SessionContext,
        game_id: GameId,
    ) -> Result<(), AdmissionError> {
        let character = ctx.character.clone().ok_or(AdmissionError::NoCharacter)?;
        let hosted = self.locate(game_id).await?;
        let game = hosted.game();
        let _admission = hosted.admission.lock().await;

        hosted.bind(character.id, Arc::clone(&peer.link)).await;
        let as_observer = match game
            .admit_player(character.clone(), ctx.ticket.as_observer, Some(character.id))
            .await
        {
            Ok(admission) => admission.as_observer,
            Err(GameError::AlreadyMember { .. }) => {
                debug!(%game_id, character = %character.id, "member re-bound to a new link");
                game.membership(character.id)
                    .await
                    .unwrap_or(ctx.ticket.as_observer)
            }
            Err(e) => {
                hosted.unbind(character.id, peer.link.id()).await;
                return Err(e.into());
            }
        };

        if !as_observer && game.claim_ownership(character.id).await {
            peer.send(Payload::GameCreated {
                game_id,
                owner: character.id,
            });
        }
        peer.set_game(Some(game_id)).await;
        self.cache
            .cache(character.clone(), &self.name, CacheLifetime::Default)
            .await;

        peer.send(Payload::GameSnapshot {
            snapshot: game.snapshot().await,
        });
        peer.send(joined_payload(game_id, character, as_observer));
        Ok(())
    }

    /// Removes `character` from the game if `link` is still the one bound
    /// to it. With `notify`, the leaver is told through `link`.
    pub(crate) async fn leave(
        &self,
        game_id: GameId,
        character: CharacterId,
        link: &Arc<dyn PacketLink>,
        notify: bool,
    ) -> bool {
        let Some(hosted) = self.hosted(game_id).await else {
            return false;
        };
        if !hosted.unbind(character, link.id()).await {
            return false;
        }
        let Some((_, was_observer)) = hosted.game.remove_member(character).await else {
            return false;
        };
        debug!(server = %self.name, %game_id, %character, was_observer, "member left");
        if notify {
            link.send(Packet::from(if was_observer {
                Payload::ObserverRemoved {
                    game_id,
                    character_id: character,
                }
            } else {
                Payload::PlayerLeft {
                    game_id,
                    character_id: character,
                }
            }));
        }
        true
    }

    /// Pre-registers a session Central handed over on the parent link.
    pub(crate) async fn accept_handoff(
        &self,
        ticket: AuthorizationTicket,
        character: Option<CharacterInfo>,
        game: Option<GameDescriptor>,
    ) {
        if !ticket.targets(&self.name) {
            warn!(server = %self.name, target = %ticket.target_server, "handoff for another server ignored");
            return;
        }
        if let Some(existing) = self.sessions.get(&ticket.account_name).await {
            if existing.ticket.authorized_on >= ticket.authorized_on {
                debug!(account = %ticket.account_name, "stale handoff ignored");
                return;
            }
        }
        if let Some(character) = character {
            self.cache
                .cache(character, &self.name, CacheLifetime::Default)
                .await;
        }
        if let Some(descriptor) = game {
            self.handed_off
                .write()
                .await
                .insert(descriptor.game_id, descriptor);
        }
        debug!(
            server = %self.name,
            account = %ticket.account_name,
            authorized_by = %ticket.authorizing_server,
            "session handed over"
        );
        self.sessions
            .authorize(SessionRecord::from_ticket(ticket), false)
            .await;
    }

    /// Runs one directory purge pass. Returns how many games were retired.
    pub async fn purge(&self) -> usize {
        self.purge_at(Utc::now()).await
    }

    pub async fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let purged = self.games.purge_at(now).await;
        for p in &purged {
            debug!(server = %self.name, game_id = %p.game.id(), reason = ?p.reason, "game purged");
            self.retire(p.game.id()).await;
        }
        purged.len()
    }

    async fn retire(&self, game_id: GameId) {
        self.retired.write().await.insert(game_id);
        self.handed_off.write().await.remove(&game_id);
        let Some(hosted) = self.hosted.write().await.remove(&game_id) else {
            return;
        };
        hosted.game.unsubscribe(hosted.subscription).await;
        for parent in self.connections.parents().await {
            parent.send(Packet::from(Payload::GameRemoved { game_id }));
        }
        info!(server = %self.name, %game_id, "game retired");
    }

    /// Sends the game's listing row to every parent link.
    async fn announce(&self, game: &Game) {
        let entry = game.list_entry(&self.name).await;
        for parent in self.connections.parents().await {
            parent.send(Packet::from(Payload::GameStatus {
                entry: entry.clone(),
            }));
        }
    }
}

fn joined_payload(game_id: GameId, character: CharacterInfo, as_observer: bool) -> Payload {
    if as_observer {
        Payload::ObserverJoined {
            game_id,
            observer: character,
        }
    } else {
        Payload::PlayerJoined {
            game_id,
            player: character,
        }
    }
}

/// Turns a game's events into member broadcasts and parent status rows.
/// Ends when the game's subscription is dropped.
async fn forward(
    hosted: Arc<HostedGame>,
    mut events: mpsc::UnboundedReceiver<GameEvent>,
    server: String,
    connections: Arc<ConnectionRegistry>,
) {
    while let Some(event) = events.recv().await {
        if event.changes_listing() {
            let entry = hosted.game.list_entry(&server).await;
            for parent in connections.parents().await {
                parent.send(Packet::from(Payload::GameStatus {
                    entry: entry.clone(),
                }));
            }
        }

        let (payload, skip) = match event {
            GameEvent::PlayerJoined { game_id, player } => {
                let id = player.id;
                (Payload::PlayerJoined { game_id, player }, Some(id))
            }
            GameEvent::ObserverJoined { game_id, observer } => {
                let id = observer.id;
                (Payload::ObserverJoined { game_id, observer }, Some(id))
            }
            GameEvent::PlayerLeft {
                game_id,
                character_id,
            } => (
                Payload::PlayerLeft {
                    game_id,
                    character_id,
                },
                None,
            ),
            GameEvent::ObserverRemoved {
                game_id,
                character_id,
            } => (
                Payload::ObserverRemoved {
                    game_id,
                    character_id,
                },
                None,
            ),
            GameEvent::Started { game_id } => (Payload::GameStarted { game_id }, None),
            GameEvent::Ended { game_id, solved } => (Payload::GameEnded { game_id, solved }, None),
            GameEvent::OwnerChanged { .. } | GameEvent::Abandoned { .. } | GameEvent::Message { .. } => {
                continue;
            }
        };
        hosted.broadcast(&payload, skip).await;
    }
    debug!(%server, game_id = %hosted.game.id(), "event forwarder stopped");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Routes every hosted game's table carries.
fn game_routes() -> Vec<Route> {
    vec![
        (
            PacketType::Generic,
            Subtype::RequestStartGame,
            named_handler("content::request_start", on_request_start),
        ),
        (
            PacketType::Match,
            Subtype::LoadProgress,
            named_handler("content::load_progress", on_load_progress),
        ),
        (
            PacketType::Match,
            Subtype::Chat,
            named_handler("content::chat", on_chat),
        ),
        (
            PacketType::Match,
            Subtype::ConcludeGame,
            named_handler("content::conclude", on_conclude),
        ),
        (
            PacketType::Generic,
            Subtype::LeaveGame,
            named_handler("content::leave", on_leave),
        ),
    ]
}

/// Routes registered on the parent link.
pub(crate) fn parent_routes() -> Vec<Route> {
    vec![(
        PacketType::Cluster,
        Subtype::SessionHandoff,
        named_handler("content::session_handoff", on_session_handoff),
    )]
}

/// The hosted game the peer is in, and its character.
async fn in_game(peer: &Peer) -> Result<(Arc<HostedGame>, CharacterInfo), HandlerError> {
    let content = peer
        .node()
        .content()
        .ok_or_else(|| HandlerError::Failed("not a content node".into()))?;
    let game_id = peer
        .game()
        .await
        .ok_or_else(|| HandlerError::Failed("not in a game".into()))?;
    let hosted = content
        .hosted(game_id)
        .await
        .ok_or_else(|| HandlerError::Failed(GameError::NotFound(game_id).to_string()))?;
    let character = peer
        .character()
        .await
        .ok_or_else(|| HandlerError::Failed("no active character".into()))?;
    Ok((hosted, character))
}

async fn on_request_start(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let (hosted, character) = in_game(&peer).await?;
    let reply = match hosted.game.request_start(character.id).await {
        Ok(()) => Payload::StartGameReply {
            accepted: true,
            message: String::new(),
        },
        Err(e) => Payload::StartGameReply {
            accepted: false,
            message: e.to_string(),
        },
    };
    peer.reply(&packet, reply);
    hosted.game.start_if_loaded().await;
    Ok(())
}

async fn on_load_progress(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::LoadProgress { percent } = packet.payload else {
        return Err(unexpected(&packet));
    };
    let (hosted, character) = in_game(&peer).await?;
    hosted
        .game
        .report_load(character.id, percent)
        .await
        .map_err(|e| HandlerError::Failed(e.to_string()))?;
    hosted.game.start_if_loaded().await;
    Ok(())
}

async fn on_chat(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::Chat { text } = &packet.payload else {
        return Err(unexpected(&packet));
    };
    let (hosted, character) = in_game(&peer).await?;
    hosted
        .game
        .post_message(format!("{}: {}", character.name, text))
        .await;
    hosted
        .broadcast(
            &Payload::ChatMessage {
                game_id: hosted.game.id(),
                from: character.id,
                text: text.clone(),
            },
            None,
        )
        .await;
    Ok(())
}

async fn on_conclude(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::ConcludeGame { solved } = packet.payload else {
        return Err(unexpected(&packet));
    };
    let (hosted, character) = in_game(&peer).await?;
    if hosted.game.owner().await != character.id {
        return Err(HandlerError::Failed(
            GameError::NotOwner {
                game_id: hosted.game.id(),
                character: character.id,
            }
            .to_string(),
        ));
    }
    hosted.game.conclude(solved).await;
    Ok(())
}

async fn on_leave(peer: Arc<Peer>, _packet: Packet) -> HandlerResult {
    let (hosted, character) = in_game(&peer).await?;
    peer.set_game(None).await;
    if let Some(content) = peer.node().content() {
        content
            .leave(hosted.game.id(), character.id, &peer.link, true)
            .await;
    }
    Ok(())
}

async fn on_session_handoff(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::SessionHandoff {
        ticket,
        character,
        game,
    } = packet.payload
    else {
        return Err(unexpected(&packet));
    };
    let content = peer
        .node()
        .content()
        .ok_or_else(|| HandlerError::Failed("not a content node".into()))?;
    content.accept_handoff(ticket, character, game).await;
    Ok(())
}
