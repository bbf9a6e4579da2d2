//! End-to-end flows through an in-process Central and Content node.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use waypoint::config::ContentServerEntry;
use waypoint::prelude::*;
use waypoint_protocol::{
    AuthorizationTicket, CharacterInfo, GameId, GameOptions, GameState, LinkEvent, Packet,
    PacketLink, Payload, ServerAddress,
};
use waypoint_session::{Account, DurableStore, MemoryStore, REASON_DUPLICATE_LOGIN};

// =========================================================================
// Helpers
// =========================================================================

struct Cluster {
    store: Arc<MemoryStore>,
    central: Arc<Node>,
    content: Arc<Node>,
    connector: Arc<LocalConnector>,
}

const CLUSTER_SECRET: &str = "cluster-test-secret";

fn node_config(name: &str, role: Role) -> NodeConfig {
    let mut config = NodeConfig::named(name, role);
    config.cluster.secret = Some(CLUSTER_SECRET.into());
    config
}

fn content_config() -> NodeConfig {
    let mut config = node_config("Content1", Role::Content);
    config.node.bind_address = "127.0.0.1:7101".into();
    config
}

async fn cluster() -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let central = Node::start(node_config("Central", Role::Central), store.clone()).await;
    let content = Node::start(content_config(), store.clone()).await;
    content
        .link_to_central(&central)
        .await
        .expect("content should link to central");

    let connector = Arc::new(LocalConnector::new());
    connector.add(Arc::clone(&central)).await;
    connector.add(Arc::clone(&content)).await;

    let c = Cluster {
        store,
        central,
        content,
        connector,
    };
    let central = Arc::clone(&c.central);
    eventually(move || {
        let central = Arc::clone(&central);
        async move {
            let cluster = central.central().expect("central service").cluster();
            cluster.get("Content1").await.is_some_and(|s| s.online)
        }
    })
    .await;
    c
}

/// Central knows Content1 from its config only; no parent link, so every
/// transfer to Content1 is unassisted.
async fn static_cluster() -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let mut central_config = node_config("Central", Role::Central);
    central_config
        .central
        .content_servers
        .push(ContentServerEntry {
            name: "Content1".into(),
            address: "ws://127.0.0.1:7101".into(),
            max_games: 2,
        });
    let central = Node::start(central_config, store.clone()).await;
    let content = Node::start(content_config(), store.clone()).await;

    let connector = Arc::new(LocalConnector::new());
    connector.add(Arc::clone(&central)).await;
    connector.add(Arc::clone(&content)).await;
    Cluster {
        store,
        central,
        content,
        connector,
    }
}

/// A raw client-side connection to `node`, with `port` as its endpoint.
async fn raw_link(node: &Arc<Node>, port: u16) -> waypoint::Conduit {
    node.open_local(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .expect("open")
}

async fn closed_reason(conduit: &mut waypoint::Conduit) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), conduit.inbound.recv())
            .await
            .expect("close in time")
            .expect("close event");
        if let LinkEvent::Closed { reason } = event {
            return reason;
        }
    }
}

fn central_address() -> ServerAddress {
    ServerAddress {
        name: "Central".into(),
        address: "local://central".into(),
    }
}

/// Stores the ticket a login service would have issued for Central.
async fn issue_login_ticket(store: &MemoryStore, account: &Account, character: &CharacterInfo) {
    let ticket = AuthorizationTicket::issue(
        "Login",
        "Central",
        account.id,
        account.name.as_str(),
        character.id,
        None,
    );
    store.persist_ticket(&ticket).await.expect("persist ticket");
}

async fn account(store: &MemoryStore, name: &str) -> (Account, CharacterInfo) {
    let account = store.register_account(name, false).await;
    let character = store
        .create_character(account.id, name)
        .await
        .expect("create character");
    issue_login_ticket(store, &account, &character).await;
    (account, character)
}

/// A client logged in to Central.
async fn client(c: &Cluster, name: &str) -> (GameClient, CharacterInfo) {
    let (_, character) = account(&c.store, name).await;
    let client = GameClient::new(name, c.connector.clone(), ClientConfig::default());
    let id = client
        .connect_central(central_address())
        .await
        .expect("central login");
    assert_eq!(id, character.id);
    (client, character)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn next_matching(
    events: &mut UnboundedReceiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event should arrive in time")
}

fn options(name: &str, max_players: usize) -> GameOptions {
    GameOptions {
        name: name.into(),
        ..GameOptions::with_max_players(max_players)
    }
}

// =========================================================================
// Creation and handoff
// =========================================================================

#[tokio::test]
async fn test_create_game_hands_off_and_admits_owner_in_lobby() {
    let c = cluster().await;
    let (alice, character) = client(&c, "alice").await;
    let (_, mut events) = alice.subscribe().await;

    let game_id = alice
        .create_game(options("Puzzle", 4))
        .await
        .expect("create should succeed");

    let placed = next_matching(&mut events, |e| {
        matches!(e, ClientEvent::CentralCreationResolved { .. })
    })
    .await;
    assert_eq!(
        placed,
        ClientEvent::CentralCreationResolved {
            game_id,
            server: ServerAddress {
                name: "Content1".into(),
                address: "ws://127.0.0.1:7101".into(),
            },
        }
    );
    let created = next_matching(&mut events, |e| {
        matches!(e, ClientEvent::ContentCreationResolved { .. })
    })
    .await;
    assert_eq!(
        created,
        ClientEvent::ContentCreationResolved {
            game_id,
            owner: character.id,
        }
    );

    let mirror = alice.game().await.expect("mirror after join");
    assert_eq!(mirror.id(), game_id);
    assert_eq!(mirror.owner().await, character.id);
    assert_eq!(mirror.state().await, GameState::Lobby);
    assert_eq!(mirror.player_count().await, 1);

    let hosted = c
        .content
        .content()
        .expect("content service")
        .hosted(game_id)
        .await
        .expect("game hosted on content");
    assert_eq!(hosted.game().owner().await, character.id);

    let central = Arc::clone(&c.central);
    eventually(move || {
        let central = Arc::clone(&central);
        async move {
            let listing = central.central().expect("central service").listing();
            listing
                .get(game_id)
                .await
                .is_some_and(|g| g.entry.player_count == 1 && g.entry.name == "Puzzle")
        }
    })
    .await;
}

#[tokio::test]
async fn test_create_game_invalid_options_rejected() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;

    let err = alice
        .create_game(GameOptions {
            min_players: 5,
            ..GameOptions::with_max_players(2)
        })
        .await
        .expect_err("min above max must be refused");
    assert!(matches!(err, WaypointError::Rejected(_)));
    assert!(err.to_string().contains("create rejected: invalid game options"));
}

#[tokio::test]
async fn test_join_unknown_game_rejected() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;

    let err = alice
        .join_game(GameId(999), false)
        .await
        .expect_err("unknown game must be refused");
    assert_eq!(err.to_string(), "rejected: join rejected: target game unknown");
}

#[tokio::test]
async fn test_join_game_second_player_notifies_owner() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, bob_character) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Duo", 2)).await.expect("create");
    let (_, mut alice_events) = alice.subscribe().await;

    let as_observer = bob.join_game(game_id, false).await.expect("join");
    assert!(!as_observer);

    let joined = next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::PlayerJoined { .. })
    })
    .await;
    assert_eq!(
        joined,
        ClientEvent::PlayerJoined {
            game_id,
            player: bob_character.clone(),
        }
    );
    let bob_mirror = bob.game().await.expect("bob mirror");
    assert_eq!(bob_mirror.player_count().await, 2);
    let alice_mirror = alice.game().await.expect("alice mirror");
    assert!(alice_mirror.player(bob_character.id).await.is_some());
}

#[tokio::test]
async fn test_join_game_full_rejected_by_central() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, _) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Solo", 1)).await.expect("create");

    let central = Arc::clone(&c.central);
    eventually(move || {
        let central = Arc::clone(&central);
        async move {
            let listing = central.central().expect("central service").listing();
            listing.get(game_id).await.is_some_and(|g| g.entry.player_count == 1)
        }
    })
    .await;

    let err = bob.join_game(game_id, false).await.expect_err("full");
    assert_eq!(err.to_string(), "rejected: join rejected: game is full");
}

#[tokio::test]
async fn test_join_game_as_observer_notifies_players() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (carol, carol_character) = client(&c, "carol").await;
    let game_id = alice.create_game(options("Watched", 2)).await.expect("create");
    let (_, mut alice_events) = alice.subscribe().await;

    assert!(carol.join_game(game_id, true).await.expect("observe"));

    let joined = next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::ObserverJoined { .. })
    })
    .await;
    assert_eq!(
        joined,
        ClientEvent::ObserverJoined {
            game_id,
            observer: carol_character,
        }
    );
    let mirror = carol.game().await.expect("observer mirror");
    assert_eq!(mirror.observer_count().await, 1);
    assert_eq!(mirror.player_count().await, 1);
}

#[tokio::test]
async fn test_quick_match_joins_open_game() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, _) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Open", 4)).await.expect("create");

    assert_eq!(bob.quick_match().await.expect("quick match"), game_id);
    assert_eq!(bob.game().await.expect("mirror").player_count().await, 2);
}

#[tokio::test]
async fn test_quick_match_without_games_creates_one_owned_by_caller() {
    let c = cluster().await;
    let (alice, character) = client(&c, "alice").await;

    let game_id = alice.quick_match().await.expect("quick match");
    let mirror = alice.game().await.expect("mirror");
    assert_eq!(mirror.id(), game_id);
    assert_eq!(mirror.owner().await, character.id);
}

// =========================================================================
// In-match traffic
// =========================================================================

#[tokio::test]
async fn test_request_start_reply_correlated_then_started_after_load() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    alice.create_game(options("Race", 2)).await.expect("create");
    let (_, mut events) = alice.subscribe().await;

    let (accepted, message) = alice.request_start().await.expect("start reply");
    assert!(accepted, "owner start refused: {message}");
    next_matching(&mut events, |e| {
        matches!(e, ClientEvent::StartGameReply { accepted: true, .. })
    })
    .await;

    let mirror = alice.game().await.expect("mirror");
    assert_eq!(mirror.state().await, GameState::Lobby);

    alice.report_load(100.0).await.expect("load");
    next_matching(&mut events, |e| matches!(e, ClientEvent::GameStarted { .. })).await;
    assert_eq!(mirror.state().await, GameState::Started);
}

#[tokio::test]
async fn test_request_start_by_non_owner_refused() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, _) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Owned", 2)).await.expect("create");
    bob.join_game(game_id, false).await.expect("join");

    let (accepted, message) = bob.request_start().await.expect("start reply");
    assert!(!accepted);
    assert!(message.contains("does not own"), "unexpected message: {message}");
}

#[tokio::test]
async fn test_chat_broadcast_to_every_member() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, bob_character) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Talk", 2)).await.expect("create");
    let (_, mut alice_events) = alice.subscribe().await;
    bob.join_game(game_id, false).await.expect("join");
    next_matching(&mut alice_events, |e| matches!(e, ClientEvent::PlayerJoined { .. })).await;

    bob.chat("hello").await.expect("chat");

    let chat = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::Chat { .. })).await;
    assert_eq!(
        chat,
        ClientEvent::Chat {
            game_id,
            from: bob_character.id,
            text: "hello".into(),
        }
    );
    let mirror = alice.game().await.expect("mirror");
    assert_eq!(mirror.messages().await, vec!["bob: hello".to_string()]);
}

#[tokio::test]
async fn test_leave_game_resolves_and_notifies_others() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, bob_character) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Brief", 2)).await.expect("create");
    bob.join_game(game_id, false).await.expect("join");
    let (_, mut alice_events) = alice.subscribe().await;
    let (_, mut bob_events) = bob.subscribe().await;

    bob.leave_game().await.expect("leave");

    assert_eq!(
        next_matching(&mut bob_events, |e| matches!(e, ClientEvent::LeaveResolved { .. })).await,
        ClientEvent::LeaveResolved { game_id }
    );
    assert_eq!(
        next_matching(&mut alice_events, |e| matches!(e, ClientEvent::PlayerLeft { .. })).await,
        ClientEvent::PlayerLeft {
            game_id,
            character_id: bob_character.id,
        }
    );
    assert!(bob.game().await.is_none());
}

#[tokio::test]
async fn test_conclude_by_owner_ends_game_for_everyone() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, _) = client(&c, "bob").await;
    let game_id = alice.create_game(options("Finale", 2)).await.expect("create");
    bob.join_game(game_id, false).await.expect("join");
    let (_, mut bob_events) = bob.subscribe().await;

    alice.conclude(true).await.expect("conclude");

    assert_eq!(
        next_matching(&mut bob_events, |e| matches!(e, ClientEvent::GameEnded { .. })).await,
        ClientEvent::GameEnded {
            game_id,
            solved: true,
        }
    );
    assert!(bob.game().await.expect("mirror").is_ended().await);
}

// =========================================================================
// Sessions and links
// =========================================================================

#[tokio::test]
async fn test_duplicate_login_concludes_first_connection() {
    let c = cluster().await;
    let (first, character) = client(&c, "alice").await;
    let (_, mut first_events) = first.subscribe().await;

    let account = c.store.load_account("alice").await.expect("account");
    issue_login_ticket(&c.store, &account, &character).await;
    let second = GameClient::new("alice", c.connector.clone(), ClientConfig::default());
    second
        .connect_central(central_address())
        .await
        .expect("second login");

    assert_eq!(
        next_matching(&mut first_events, |e| {
            matches!(e, ClientEvent::ConnectionConcluded { .. })
        })
        .await,
        ClientEvent::ConnectionConcluded {
            server: "Central".into(),
            reason: REASON_DUPLICATE_LOGIN.into(),
        }
    );
    assert!(second.list_games().await.is_ok());
}

#[tokio::test]
async fn test_login_without_ticket_rejected() {
    let c = cluster().await;
    c.store.register_account("mallory", false).await;
    let client = GameClient::new("mallory", c.connector.clone(), ClientConfig::default());

    let err = client
        .connect_central(central_address())
        .await
        .expect_err("no ticket");
    assert!(matches!(err, WaypointError::Rejected(_)));
}

#[tokio::test]
async fn test_unroutable_packet_kills_link() {
    let c = cluster().await;
    let mut conduit = c
        .central
        .open_local(SocketAddr::from(([127, 0, 0, 1], 45_000)))
        .await
        .expect("open");

    conduit
        .link
        .send(Packet::from(Payload::GameStarted { game_id: GameId(1) }));

    let event = tokio::time::timeout(Duration::from_secs(2), conduit.inbound.recv())
        .await
        .expect("close in time")
        .expect("close event");
    match event {
        LinkEvent::Closed { reason } => assert!(reason.starts_with("unroutable packet"), "{reason}"),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cluster_packet_on_client_link_kills_link() {
    let c = cluster().await;
    let mut conduit = c
        .central
        .open_local(SocketAddr::from(([127, 0, 0, 1], 45_001)))
        .await
        .expect("open");

    conduit
        .link
        .send(Packet::from(Payload::GameRemoved { game_id: GameId(1) }));

    let event = tokio::time::timeout(Duration::from_secs(2), conduit.inbound.recv())
        .await
        .expect("close in time")
        .expect("close event");
    assert!(matches!(event, LinkEvent::Closed { .. }));
}

#[tokio::test]
async fn test_content_shutdown_marks_server_offline() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;

    c.content.shutdown().await;
    let central = Arc::clone(&c.central);
    eventually(move || {
        let central = Arc::clone(&central);
        async move {
            let cluster = central.central().expect("central service").cluster();
            cluster.get("Content1").await.is_some_and(|s| !s.online)
        }
    })
    .await;

    let err = alice
        .create_game(options("Nowhere", 2))
        .await
        .expect_err("no server left");
    assert_eq!(
        err.to_string(),
        "rejected: create rejected: no content server available"
    );
}

// =========================================================================
// Cluster membership
// =========================================================================

#[tokio::test]
async fn test_server_hello_with_wrong_secret_refused() {
    let c = cluster().await;
    let mut rogue = raw_link(&c.central, 45_002).await;

    rogue.link.send(Packet::from(Payload::ServerHello {
        name: "Content1".into(),
        address: "ws://evil:1".into(),
        max_games: 10,
        secret: "guess".into(),
    }));

    assert_eq!(
        closed_reason(&mut rogue).await,
        "server hello refused: cluster authentication failed"
    );
    let central = c.central.central().expect("central service");
    let info = central.cluster().get("Content1").await.expect("content1 known");
    assert_eq!(info.address, "ws://127.0.0.1:7101");
    assert!(info.online);
}

#[tokio::test]
async fn test_server_hello_cannot_take_over_live_server() {
    let c = cluster().await;
    let mut rogue = raw_link(&c.central, 45_003).await;

    rogue.link.send(Packet::from(Payload::ServerHello {
        name: "content1".into(),
        address: "ws://evil:1".into(),
        max_games: 10,
        secret: CLUSTER_SECRET.into(),
    }));

    assert_eq!(
        closed_reason(&mut rogue).await,
        "server hello refused: content server content1 already connected"
    );

    let (alice, _) = client(&c, "alice").await;
    let (_, mut events) = alice.subscribe().await;
    alice.create_game(options("Safe", 2)).await.expect("create");
    let placed = next_matching(&mut events, |e| {
        matches!(e, ClientEvent::CentralCreationResolved { .. })
    })
    .await;
    let ClientEvent::CentralCreationResolved { server, .. } = placed else {
        unreachable!();
    };
    assert_eq!(server.address, "ws://127.0.0.1:7101");
    while let Ok(event) = rogue.inbound.try_recv() {
        assert!(
            !matches!(event, LinkEvent::Packet(Packet { payload: Payload::SessionHandoff { .. }, .. })),
            "handoff leaked to a refused link"
        );
    }
}

#[tokio::test]
async fn test_server_hello_refused_without_configured_secret() {
    let store = Arc::new(MemoryStore::new());
    let central = Node::start(NodeConfig::named("Central", Role::Central), store).await;
    let mut rogue = raw_link(&central, 45_004).await;

    rogue.link.send(Packet::from(Payload::ServerHello {
        name: "Content9".into(),
        address: "ws://evil:1".into(),
        max_games: 10,
        secret: String::new(),
    }));

    assert_eq!(
        closed_reason(&mut rogue).await,
        "server hello refused: cluster secret not configured"
    );
    let cluster = central.central().expect("central service").cluster();
    assert!(cluster.get("Content9").await.is_none());
}

// =========================================================================
// Unassisted transfer
// =========================================================================

#[tokio::test]
async fn test_create_game_unassisted_admits_owner_from_store() {
    let c = static_cluster().await;
    let (alice, character) = client(&c, "alice").await;

    let game_id = alice
        .create_game(options("Offline", 2))
        .await
        .expect("create over an unassisted transfer");

    let mirror = alice.game().await.expect("mirror after join");
    assert_eq!(mirror.id(), game_id);
    assert_eq!(mirror.owner().await, character.id);
    assert_eq!(mirror.player_count().await, 1);

    let content = c.content.content().expect("content service");
    let hosted = content.hosted(game_id).await.expect("instantiated from store");
    assert_eq!(hosted.game().owner().await, character.id);
    assert!(c.content.sessions().contains("alice").await);
    assert_eq!(c.store.load_ticket_for_account("alice").await.unwrap(), None);
}

#[tokio::test]
async fn test_unclaimed_game_expires_and_frees_slot() {
    let c = static_cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let (bob, _) = client(&c, "bob").await;
    let (carol, _) = client(&c, "carol").await;
    let central = c.central.central().expect("central service");

    // Nothing reports status upstream here, so both games stay provisional.
    alice.create_game(options("One", 2)).await.expect("first");
    bob.create_game(options("Two", 2)).await.expect("second");
    let err = carol
        .create_game(options("Three", 2))
        .await
        .expect_err("content1 full");
    assert_eq!(
        err.to_string(),
        "rejected: create rejected: no content server available"
    );

    assert_eq!(central.expire_provisional().await, 0);
    let later = chrono::Utc::now() + chrono::Duration::seconds(301);
    assert_eq!(central.expire_provisional_at(later).await, 2);
    assert!(central.listing().is_empty().await);
    assert_eq!(
        central.cluster().get("Content1").await.expect("known").hosted_games,
        0
    );
}

// =========================================================================
// Purge
// =========================================================================

#[tokio::test]
async fn test_abandoned_game_purged_and_removed_from_listing() {
    let c = cluster().await;
    let (alice, _) = client(&c, "alice").await;
    let game_id = alice.create_game(options("Empty", 2)).await.expect("create");
    let (_, mut events) = alice.subscribe().await;
    alice.leave_game().await.expect("leave");
    next_matching(&mut events, |e| matches!(e, ClientEvent::LeaveResolved { .. })).await;

    let content = c.content.content().expect("content service");
    assert_eq!(content.purge().await, 0);
    let later = chrono::Utc::now() + chrono::Duration::seconds(61);
    assert_eq!(content.purge_at(later).await, 1);
    assert!(content.hosted(game_id).await.is_none());

    let central = Arc::clone(&c.central);
    eventually(move || {
        let central = Arc::clone(&central);
        async move {
            let listing = central.central().expect("central service").listing();
            listing.get(game_id).await.is_none()
        }
    })
    .await;

    let err = alice.join_game(game_id, false).await.expect_err("gone");
    assert_eq!(err.to_string(), "rejected: join rejected: target game unknown");
}
