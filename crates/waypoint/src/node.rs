//! A running Central or Content node.
//!
//! A [`Node`] owns the service objects one server process needs (session
//! registry, connection registry, character cache, ticket authority and
//! the role's own service) plus the maintenance sweeps that keep them
//! tidy. Connections reach it as [`Conduit`]s, from the WebSocket accept
//! loop or from an in-process client, and each gets a [`Peer`] context
//! with its own dispatch table and worker task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use waypoint_protocol::{
    CharacterId, CharacterInfo, DispatchTable, GameId, Handler, LinkEvent, Packet, PacketLink,
    PacketType, Payload, Subtype, dispatch_layered,
};
use waypoint_session::{
    Account, CharacterCache, ConnectionRegistry, DurableStore, ParentLinkEvent, SessionConfig,
    SessionRegistry, TicketAuthority,
};
use waypoint_sweep::{PassResult, SweepConfig, SweepHandle, Sweeper};

use crate::central::{self, Central};
use crate::config::{NodeConfig, Role};
use crate::content::{self, Content};
use crate::session;
use crate::worker::{self, Conduit, Inbound};
use crate::WaypointError;

/// Reason given to every link when a node shuts down.
pub const REASON_SHUTDOWN: &str = "server shutting down";

/// One dispatch registration: channel, subtype and the handler.
pub(crate) type Route = (PacketType, Subtype, Handler<Peer>);

enum Service {
    Central(Arc<Central>),
    Content(Arc<Content>),
}

/// A Central or Content server.
pub struct Node {
    name: String,
    config: NodeConfig,
    store: Arc<dyn DurableStore>,
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionRegistry>,
    cache: Arc<CharacterCache>,
    tickets: Arc<TicketAuthority>,
    service: Service,
    client_routes: Vec<Route>,
    parent_routes: Vec<Route>,
    sweeps: Mutex<Vec<SweepHandle>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    next_local_port: AtomicU16,
}

impl Node {
    /// Builds the node's services and starts its maintenance sweeps.
    pub async fn start(config: NodeConfig, store: Arc<dyn DurableStore>) -> Arc<Node> {
        let config = config.validated();
        let name = config.node.name.clone();
        let session_config = config.session_config();

        let sessions = Arc::new(SessionRegistry::new(
            name.clone(),
            &session_config,
            Arc::clone(&store),
        ));
        let cache = Arc::new(CharacterCache::from_config(&session_config));
        let connections = Arc::new(ConnectionRegistry::new(session_config.max_connections));
        let tickets = Arc::new(TicketAuthority::new(
            &session_config,
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&cache),
        ));

        let mut client_routes = session::routes();
        let mut parent_routes = Vec::new();
        let service = match config.node.role {
            Role::Central => {
                client_routes.extend(central::routes());
                Service::Central(Arc::new(Central::new(
                    &config,
                    Arc::clone(&store),
                    Arc::clone(&tickets),
                    Arc::clone(&connections),
                )))
            }
            Role::Content => {
                parent_routes.extend(content::parent_routes());
                Service::Content(Arc::new(Content::new(
                    &config,
                    Arc::clone(&store),
                    Arc::clone(&sessions),
                    Arc::clone(&cache),
                    Arc::clone(&connections),
                )))
            }
        };

        let node = Arc::new(Node {
            name,
            config,
            store,
            sessions,
            connections,
            cache,
            tickets,
            service,
            client_routes,
            parent_routes,
            sweeps: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            next_local_port: AtomicU16::new(1),
        });
        node.start_maintenance(&session_config).await;
        node.watch_parent_links().await;

        info!(
            node = %node.name,
            role = %node.role(),
            bind = %node.config.node.bind_address,
            "node started"
        );
        node
    }

    async fn start_maintenance(&self, session_config: &SessionConfig) {
        let mut sweeps = self.sweeps.lock().await;

        let sessions = Arc::clone(&self.sessions);
        sweeps.push(
            Sweeper::new(SweepConfig::every(
                "ticket-expiry",
                session_config.ticket_sweep_interval,
            ))
            .spawn(move || {
                let sessions = Arc::clone(&sessions);
                async move {
                    let evicted: PassResult = Ok(sessions.sweep().await);
                    evicted
                }
            }),
        );

        let cache = Arc::clone(&self.cache);
        sweeps.push(
            Sweeper::new(SweepConfig::every(
                "character-cache",
                session_config.character_cache_sweep_interval,
            ))
            .spawn(move || {
                let cache = Arc::clone(&cache);
                async move {
                    let evicted: PassResult = Ok(cache.sweep().await);
                    evicted
                }
            }),
        );

        if let Service::Central(central) = &self.service {
            let central = Arc::clone(central);
            sweeps.push(
                Sweeper::new(SweepConfig::every(
                    "provisional-games",
                    self.config.game_config().directory_sweep_interval,
                ))
                .spawn(move || {
                    let central = Arc::clone(&central);
                    async move {
                        let expired: PassResult = Ok(central.expire_provisional().await);
                        expired
                    }
                }),
            );
        }

        if let Service::Content(content) = &self.service {
            let content = Arc::clone(content);
            sweeps.push(
                Sweeper::new(SweepConfig::every(
                    "game-directory",
                    content.games().config().directory_sweep_interval,
                ))
                .spawn(move || {
                    let content = Arc::clone(&content);
                    async move {
                        let purged: PassResult = Ok(content.purge().await);
                        purged
                    }
                }),
            );
        }
    }

    async fn watch_parent_links(&self) {
        let (_, mut events) = self.connections.subscribe_parent_events().await;
        let central = self.central().cloned();
        let node = self.name.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ParentLinkEvent::Added { id, endpoint } => {
                        debug!(%node, conn_id = %id, %endpoint, "parent link added");
                    }
                    ParentLinkEvent::Lost { id, endpoint } => match &central {
                        Some(central) => central.server_lost(id).await,
                        None => warn!(%node, conn_id = %id, %endpoint, "parent link lost"),
                    },
                }
            }
        });
        self.watchers.lock().await.push(watcher);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        match self.service {
            Service::Central(_) => Role::Central,
            Service::Content(_) => Role::Content,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn cache(&self) -> &Arc<CharacterCache> {
        &self.cache
    }

    pub fn tickets(&self) -> &Arc<TicketAuthority> {
        &self.tickets
    }

    pub fn central(&self) -> Option<&Arc<Central>> {
        match &self.service {
            Service::Central(central) => Some(central),
            Service::Content(_) => None,
        }
    }

    pub fn content(&self) -> Option<&Arc<Content>> {
        match &self.service {
            Service::Content(content) => Some(content),
            Service::Central(_) => None,
        }
    }

    /// Address in-process peers see as this node's endpoint.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.config
            .node
            .bind_address
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    // -- connections ------------------------------------------------------

    /// Takes ownership of an incoming connection.
    ///
    /// A connection over capacity is told why and killed.
    pub async fn accept(self: &Arc<Self>, conduit: Conduit) -> Result<(), WaypointError> {
        let link: Arc<dyn PacketLink> = conduit.link;
        if let Err(e) = self.connections.track(Arc::clone(&link), false).await {
            warn!(node = %self.name, conn_id = %link.id(), error = %e, "connection refused");
            let reason = e.to_string();
            link.send(Packet::from(Payload::Disconnect {
                reason: reason.clone(),
            }));
            link.kill(&reason);
            return Err(e.into());
        }
        debug!(node = %self.name, conn_id = %link.id(), endpoint = %link.remote_endpoint(), "connection accepted");
        self.spawn_peer(link, conduit.inbound, &self.client_routes).await;
        Ok(())
    }

    /// Opens an in-process connection to this node from `client_endpoint`
    /// and returns the client's end.
    pub async fn open_local(self: &Arc<Self>, client_endpoint: SocketAddr) -> Result<Conduit, WaypointError> {
        let (server_side, client_side) = Conduit::pair(client_endpoint, self.local_endpoint());
        self.accept(server_side).await?;
        Ok(client_side)
    }

    /// Adopts `conduit` as this Content node's parent link and announces
    /// the node on it.
    pub async fn attach_parent(self: &Arc<Self>, conduit: Conduit) -> Result<(), WaypointError> {
        let Some(content) = self.content() else {
            return Err(WaypointError::NotReady(format!(
                "{} is not a content node",
                self.name
            )));
        };
        let link: Arc<dyn PacketLink> = conduit.link;
        self.connections.track(Arc::clone(&link), true).await?;
        self.spawn_peer(Arc::clone(&link), conduit.inbound, &self.parent_routes)
            .await;
        link.send(Packet::from(Payload::ServerHello {
            name: self.name.clone(),
            address: content.public_address().to_string(),
            max_games: content.max_games(),
            secret: self.config.cluster.secret.clone().unwrap_or_default(),
        }));
        info!(node = %self.name, conn_id = %link.id(), "parent link attached");
        Ok(())
    }

    /// Links this Content node to an in-process Central.
    pub async fn link_to_central(self: &Arc<Self>, central: &Arc<Node>) -> Result<(), WaypointError> {
        let port = self.next_local_port.fetch_add(1, Ordering::Relaxed);
        let own_endpoint = SocketAddr::from(([127, 0, 0, 1], 30_000 + port));
        let (content_side, central_side) = Conduit::pair(central.local_endpoint(), own_endpoint);
        central.accept(central_side).await?;
        self.attach_parent(content_side).await
    }

    async fn spawn_peer(
        self: &Arc<Self>,
        link: Arc<dyn PacketLink>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
        routes: &[Route],
    ) {
        let table = DispatchTable::new();
        for (kind, subtype, h) in routes {
            table.register(*kind, *subtype, Arc::clone(h)).await;
        }
        let peer = Arc::new(Peer::new(Arc::clone(self), link, table));
        tokio::spawn(worker::run(peer, inbound, self.config.node.queue_inbound));
    }

    /// Stops every sweep and watcher and kills every link.
    pub async fn shutdown(&self) {
        for sweep in self.sweeps.lock().await.drain(..) {
            sweep.stop().await;
        }
        for watcher in self.watchers.lock().await.drain(..) {
            watcher.abort();
        }
        let links = self.connections.links().await;
        for link in &links {
            link.kill(REASON_SHUTDOWN);
        }
        info!(node = %self.name, links = links.len(), "node shut down");
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PeerState {
    account: Option<Account>,
    character: Option<CharacterInfo>,
    game: Option<GameId>,
}

/// Per-connection context every handler runs against.
pub struct Peer {
    node: Arc<Node>,
    pub(crate) link: Arc<dyn PacketLink>,
    table: DispatchTable<Peer>,
    state: Mutex<PeerState>,
}

impl Peer {
    fn new(node: Arc<Node>, link: Arc<dyn PacketLink>, table: DispatchTable<Peer>) -> Self {
        Self {
            node,
            link,
            table,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Sends `payload` on its default channel.
    pub fn send(&self, payload: Payload) -> bool {
        self.link.send(Packet::from(payload))
    }

    /// Answers `request`.
    pub fn reply(&self, request: &Packet, payload: Payload) -> bool {
        self.link.send(Packet::reply_to(request, payload))
    }

    pub(crate) async fn log_in(&self, account: Account, character: Option<CharacterInfo>) {
        let mut state = self.state.lock().await;
        state.account = Some(account);
        state.character = character;
    }

    pub async fn account(&self) -> Option<Account> {
        self.state.lock().await.account.clone()
    }

    pub async fn character(&self) -> Option<CharacterInfo> {
        self.state.lock().await.character.clone()
    }

    pub async fn character_id(&self) -> CharacterId {
        self.state
            .lock()
            .await
            .character
            .as_ref()
            .map(|c| c.id)
            .unwrap_or(CharacterId::NONE)
    }

    /// The logged-in account and its active character, if logged in.
    pub async fn session(&self) -> Option<(Account, Option<CharacterInfo>)> {
        let state = self.state.lock().await;
        state
            .account
            .clone()
            .map(|account| (account, state.character.clone()))
    }

    pub async fn game(&self) -> Option<GameId> {
        self.state.lock().await.game
    }

    pub(crate) async fn set_game(&self, game: Option<GameId>) {
        self.state.lock().await.game = game;
    }
}

#[async_trait]
impl Inbound for Peer {
    fn link(&self) -> &Arc<dyn PacketLink> {
        &self.link
    }

    async fn route(self: Arc<Self>, packet: Packet) {
        let hosted = match (self.game().await, self.node.content()) {
            (Some(game_id), Some(content)) => {
                let hosted = content.hosted(game_id).await;
                if hosted.is_none() {
                    self.set_game(None).await;
                }
                hosted
            }
            _ => None,
        };
        let link = Arc::clone(&self.link);
        match hosted {
            Some(hosted) => {
                dispatch_layered(
                    &[&self.table, hosted.table()],
                    Arc::clone(&self),
                    link.as_ref(),
                    packet,
                )
                .await
            }
            None => {
                self.table
                    .dispatch(Arc::clone(&self), link.as_ref(), packet)
                    .await
            }
        };
    }

    async fn concluded(self: Arc<Self>, reason: String) {
        self.link.kill(&reason);
        let conn = self.link.id();
        self.node.connections.remove(conn).await;

        let state = std::mem::take(&mut *self.state.lock().await);
        if let Some(account) = &state.account {
            let loss = self.node.sessions.connection_lost(&account.name, conn).await;
            debug!(account = %account.name, %conn, ?loss, "session connection lost");
        }
        if let (Some(content), Some(game_id), Some(character)) =
            (self.node.content(), state.game, state.character)
        {
            content.leave(game_id, character.id, &self.link, false).await;
        }
    }
}
