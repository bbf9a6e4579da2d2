//! The Central broker: game listing, creation arbitration and placement.
//!
//! Central never hosts a game. It approves a game, picks the Content
//! server that will host it, persists the descriptor and issues the ticket
//! the client carries there. When the Content server holds a parent link,
//! Central also hands the session over on it so the client's login there
//! is assisted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use waypoint_game::{GameListing, ListedGame};
use waypoint_protocol::{
    CharacterInfo, ConnectionId, GameDescriptor, GameId, GameOptions, HandlerError, HandlerResult,
    Packet, PacketType, Payload, ServerAddress, Subtype, named_handler,
};
use waypoint_session::{
    Account, ConnectionRegistry, DurableStore, SessionError, StoreError, TicketAuthority,
};

use crate::cluster::{ClusterDirectory, ContentServerInfo};
use crate::config::NodeConfig;
use crate::node::{Peer, Route};
use crate::session::unexpected;

/// Why Central refused to place a client.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("login required")]
    NotLoggedIn,

    #[error("no active character")]
    NoCharacter,

    #[error("invalid game options: {0}")]
    InvalidOptions(String),

    #[error("no content server available")]
    NoServer,

    #[error("target game unknown")]
    UnknownGame,

    #[error("game has ended")]
    Ended,

    #[error("game is full")]
    Full,

    #[error("observers not allowed")]
    ObserversNotAllowed,

    #[error("host server offline")]
    HostOffline,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why Central refused a `ServerHello`.
#[derive(Debug, thiserror::Error)]
pub enum HelloRejection {
    #[error("cluster secret not configured")]
    NoSecret,

    #[error("cluster authentication failed")]
    BadSecret,

    #[error("content server {0} already connected")]
    NameTaken(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What a quick match resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum QuickMatch {
    Joined { game_id: GameId, server: ServerAddress },
    Created { game: GameDescriptor, server: ServerAddress },
}

pub struct Central {
    name: String,
    listing: GameListing,
    cluster: ClusterDirectory,
    next_game: AtomicU64,
    cluster_secret: Option<String>,
    provisional_ttl: chrono::Duration,
    store: Arc<dyn DurableStore>,
    tickets: Arc<TicketAuthority>,
    connections: Arc<ConnectionRegistry>,
}

impl Central {
    pub(crate) fn new(
        config: &NodeConfig,
        store: Arc<dyn DurableStore>,
        tickets: Arc<TicketAuthority>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            name: config.node.name.clone(),
            listing: GameListing::new(),
            cluster: ClusterDirectory::new(&config.central.content_servers),
            next_game: AtomicU64::new(1),
            cluster_secret: config.cluster.secret.clone(),
            provisional_ttl: config.session_config().ticket_lifetime_chrono(),
            store,
            tickets,
            connections,
        }
    }

    pub fn listing(&self) -> &GameListing {
        &self.listing
    }

    pub fn cluster(&self) -> &ClusterDirectory {
        &self.cluster
    }

    /// Approves a new game on the least-loaded Content server and places
    /// the requester in it.
    pub async fn create_game(
        &self,
        account: &Account,
        character: Option<CharacterInfo>,
        options: GameOptions,
    ) -> Result<(GameDescriptor, ServerAddress), PlacementError> {
        let character = character.ok_or(PlacementError::NoCharacter)?;
        options.check().map_err(PlacementError::InvalidOptions)?;
        let server = self
            .cluster
            .reserve_least_loaded()
            .await
            .ok_or(PlacementError::NoServer)?;

        let descriptor = GameDescriptor {
            game_id: GameId(self.next_game.fetch_add(1, Ordering::Relaxed)),
            target_server: server.name.clone(),
            options,
            owner: character.id,
        };

        if let Err(e) = self.store.persist_game_descriptor(&descriptor).await {
            self.cluster.release(&server.name).await;
            return Err(e.into());
        }
        self.listing
            .insert(ListedGame::provisional(descriptor.clone()))
            .await;

        if let Err(e) = self.place(account, &character, &descriptor, false, &server).await {
            self.listing.remove(descriptor.game_id).await;
            self.cluster.release(&server.name).await;
            return Err(e);
        }

        info!(
            central = %self.name,
            game_id = %descriptor.game_id,
            server = %server.name,
            owner = %character.id,
            "game approved"
        );
        Ok((descriptor, server.server_address()))
    }

    /// Places the requester into an existing game.
    pub async fn join_game(
        &self,
        account: &Account,
        character: Option<CharacterInfo>,
        game_id: GameId,
        as_observer: bool,
    ) -> Result<ServerAddress, PlacementError> {
        let character = character.ok_or(PlacementError::NoCharacter)?;
        let listed = self
            .listing
            .get(game_id)
            .await
            .ok_or(PlacementError::UnknownGame)?;

        if listed.entry.ended {
            return Err(PlacementError::Ended);
        }
        if as_observer {
            if !listed.descriptor.options.allow_observers {
                return Err(PlacementError::ObserversNotAllowed);
            }
        } else if listed.entry.player_count >= listed.entry.max_players {
            return Err(PlacementError::Full);
        }

        let server = self
            .cluster
            .get(&listed.entry.target_server)
            .await
            .filter(|s| s.online)
            .ok_or(PlacementError::HostOffline)?;

        self.place(account, &character, &listed.descriptor, as_observer, &server)
            .await?;
        debug!(central = %self.name, %game_id, character = %character.id, as_observer, "join placed");
        Ok(server.server_address())
    }

    /// Joins the first joinable game, or creates one with default options.
    pub async fn quick_match(
        &self,
        account: &Account,
        character: Option<CharacterInfo>,
    ) -> Result<QuickMatch, PlacementError> {
        if let Some(listed) = self.listing.quick_match().await {
            let game_id = listed.entry.game_id;
            match self.join_game(account, character.clone(), game_id, false).await {
                Ok(server) => return Ok(QuickMatch::Joined { game_id, server }),
                Err(e) => debug!(%game_id, error = %e, "quick match candidate refused, creating"),
            }
        }
        let options = GameOptions {
            name: "Quick match".to_string(),
            ..GameOptions::default()
        };
        let (game, server) = self.create_game(account, character, options).await?;
        Ok(QuickMatch::Created { game, server })
    }

    /// Issues the ticket for `server` and, when the server holds a parent
    /// link, hands the session over on it.
    async fn place(
        &self,
        account: &Account,
        character: &CharacterInfo,
        descriptor: &GameDescriptor,
        as_observer: bool,
        server: &ContentServerInfo,
    ) -> Result<(), PlacementError> {
        let ticket = self
            .tickets
            .issue_ticket(
                &server.name,
                account,
                character.id,
                Some(descriptor.game_id),
                as_observer,
            )
            .await?;

        let link = match server.link {
            Some(id) => self.connections.get(id).await,
            None => None,
        };
        match link {
            Some(link) => {
                link.send(Packet::from(Payload::SessionHandoff {
                    ticket,
                    character: Some(character.clone()),
                    game: Some(descriptor.clone()),
                }));
                debug!(account = %account.name, server = %server.name, "session handed off");
            }
            None => {
                debug!(account = %account.name, server = %server.name, "no parent link, transfer will be unassisted");
            }
        }
        Ok(())
    }

    /// Checks a `ServerHello` received on `conn` and records the server.
    ///
    /// The secret must match the cluster's, and a name still bound to
    /// another live link is not taken over.
    pub async fn register_server(
        &self,
        name: &str,
        address: &str,
        max_games: usize,
        secret: &str,
        conn: ConnectionId,
    ) -> Result<(), HelloRejection> {
        let expected = self.cluster_secret.as_deref().ok_or(HelloRejection::NoSecret)?;
        if secret != expected {
            return Err(HelloRejection::BadSecret);
        }
        if let Some(bound) = self.cluster.get(name).await.and_then(|s| s.link) {
            let live = match self.connections.get(bound).await {
                Some(link) => link.is_alive(),
                None => false,
            };
            if bound != conn && live {
                return Err(HelloRejection::NameTaken(name.to_string()));
            }
        }
        self.connections.promote_to_parent(conn).await?;
        self.cluster.announce(name, address, max_games, conn).await;
        Ok(())
    }

    /// Drops approved games no Content server ever reported on and gives
    /// their slots back. Returns how many were dropped.
    pub async fn expire_provisional(&self) -> usize {
        self.expire_provisional_at(Utc::now()).await
    }

    pub async fn expire_provisional_at(&self, now: DateTime<Utc>) -> usize {
        let expired = self
            .listing
            .expire_provisional_at(now, self.provisional_ttl)
            .await;
        for listed in &expired {
            self.cluster.release(&listed.entry.target_server).await;
            info!(
                central = %self.name,
                game_id = %listed.descriptor.game_id,
                server = %listed.entry.target_server,
                "unclaimed game expired"
            );
        }
        expired.len()
    }

    /// A Content server's parent link closed.
    pub async fn server_lost(&self, link: ConnectionId) {
        if let Some(name) = self.cluster.mark_offline(link).await {
            let dropped = self.listing.remove_hosted_on(&name).await;
            warn!(central = %self.name, server = %name, games = dropped.len(), "content server lost");
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub(crate) fn routes() -> Vec<Route> {
    vec![
        (
            PacketType::Generic,
            Subtype::RequestGameListing,
            named_handler("central::game_listing", on_game_listing),
        ),
        (
            PacketType::Generic,
            Subtype::RequestCreateGame,
            named_handler("central::create_game", on_create_game),
        ),
        (
            PacketType::Generic,
            Subtype::RequestQuickMatch,
            named_handler("central::quick_match", on_quick_match),
        ),
        (
            PacketType::Generic,
            Subtype::RequestJoinGame,
            named_handler("central::join_game", on_join_game),
        ),
        (
            PacketType::Cluster,
            Subtype::ServerHello,
            named_handler("central::server_hello", on_server_hello),
        ),
        (
            PacketType::Cluster,
            Subtype::GameStatus,
            named_handler("central::game_status", on_game_status),
        ),
        (
            PacketType::Cluster,
            Subtype::GameRemoved,
            named_handler("central::game_removed", on_game_removed),
        ),
    ]
}

fn central_of(peer: &Peer) -> Result<&Arc<Central>, HandlerError> {
    peer.node().central().ok_or_else(|| {
        HandlerError::Failed(format!("{} is not a central node", peer.node().name()))
    })
}

fn create_result(result: Result<(GameDescriptor, ServerAddress), PlacementError>) -> Payload {
    match result {
        Ok((game, server)) => Payload::CreateGameResult {
            accepted: true,
            message: String::new(),
            game: Some(game),
            server: Some(server),
        },
        Err(e) => Payload::CreateGameResult {
            accepted: false,
            message: format!("create rejected: {e}"),
            game: None,
            server: None,
        },
    }
}

fn join_result(game_id: GameId, result: Result<ServerAddress, PlacementError>) -> Payload {
    match result {
        Ok(server) => Payload::JoinGameResult {
            accepted: true,
            message: String::new(),
            game_id: Some(game_id),
            server: Some(server),
        },
        Err(e) => Payload::JoinGameResult {
            accepted: false,
            message: format!("join rejected: {e}"),
            game_id: Some(game_id),
            server: None,
        },
    }
}

async fn on_game_listing(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let central = central_of(&peer)?;
    let games = central.listing().entries().await;
    peer.reply(&packet, Payload::GameListing { games });
    Ok(())
}

async fn on_create_game(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::RequestCreateGame { options } = &packet.payload else {
        return Err(unexpected(&packet));
    };
    let central = central_of(&peer)?;
    let result = match peer.session().await {
        Some((account, character)) => {
            central
                .create_game(&account, character, options.clone())
                .await
        }
        None => Err(PlacementError::NotLoggedIn),
    };
    if let Err(e) = &result {
        debug!(conn_id = %peer.link.id(), error = %e, "create rejected");
    }
    peer.reply(&packet, create_result(result));
    Ok(())
}

async fn on_quick_match(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let central = central_of(&peer)?;
    let result = match peer.session().await {
        Some((account, character)) => central.quick_match(&account, character).await,
        None => Err(PlacementError::NotLoggedIn),
    };
    let payload = match result {
        Ok(QuickMatch::Joined { game_id, server }) => join_result(game_id, Ok(server)),
        Ok(QuickMatch::Created { game, server }) => create_result(Ok((game, server))),
        Err(e) => create_result(Err(e)),
    };
    peer.reply(&packet, payload);
    Ok(())
}

async fn on_join_game(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::RequestJoinGame {
        game_id,
        as_observer,
    } = &packet.payload
    else {
        return Err(unexpected(&packet));
    };
    let central = central_of(&peer)?;
    let result = match peer.session().await {
        Some((account, character)) => {
            central
                .join_game(&account, character, *game_id, *as_observer)
                .await
        }
        None => Err(PlacementError::NotLoggedIn),
    };
    if let Err(e) = &result {
        debug!(conn_id = %peer.link.id(), %game_id, error = %e, "join rejected");
    }
    peer.reply(&packet, join_result(*game_id, result));
    Ok(())
}

async fn on_server_hello(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::ServerHello {
        name,
        address,
        max_games,
        secret,
    } = &packet.payload
    else {
        return Err(unexpected(&packet));
    };
    let central = central_of(&peer)?;
    let conn = peer.link.id();
    if let Err(rejection) = central
        .register_server(name, address, *max_games, secret, conn)
        .await
    {
        warn!(
            conn_id = %conn,
            server = %name,
            %rejection,
            "server hello refused"
        );
        peer.link.kill(&format!("server hello refused: {rejection}"));
    }
    Ok(())
}

/// Cluster packets are only accepted on a parent link.
async fn require_parent(peer: &Peer, packet: &Packet) -> bool {
    if peer.node().connections().is_parent(peer.link.id()).await {
        return true;
    }
    warn!(
        conn_id = %peer.link.id(),
        subtype = ?packet.subtype(),
        "cluster packet on a client link"
    );
    peer.link.kill("cluster packet on a client link");
    false
}

async fn on_game_status(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::GameStatus { entry } = &packet.payload else {
        return Err(unexpected(&packet));
    };
    if !require_parent(&peer, &packet).await {
        return Ok(());
    }
    let central = central_of(&peer)?;
    if !central.listing().update(entry.clone()).await {
        debug!(game_id = %entry.game_id, "status for a game central never approved");
    }
    Ok(())
}

async fn on_game_removed(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::GameRemoved { game_id } = &packet.payload else {
        return Err(unexpected(&packet));
    };
    if !require_parent(&peer, &packet).await {
        return Ok(());
    }
    let central = central_of(&peer)?;
    if let Some(listed) = central.listing().remove(*game_id).await {
        central.cluster().release(&listed.entry.target_server).await;
        info!(%game_id, server = %listed.entry.target_server, "game removed from listing");
    }
    Ok(())
}
