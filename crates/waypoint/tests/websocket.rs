//! A Central node served over a real WebSocket listener.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use waypoint::prelude::*;
use waypoint_protocol::{AuthorizationTicket, Codec, JsonCodec, Packet, Payload, ServerAddress};
use waypoint_session::{DurableStore, MemoryStore};

// =========================================================================
// Helpers
// =========================================================================

async fn serve_central(store: Arc<MemoryStore>) -> String {
    let mut config = NodeConfig::named("Central", Role::Central);
    config.node.bind_address = "127.0.0.1:0".into();
    let node = Node::start(config, store).await;
    let server = NodeServer::bind(node).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    format!("ws://{addr}")
}

// =========================================================================
// Client flows
// =========================================================================

#[tokio::test]
async fn test_ws_client_logs_in_and_lists_games() {
    let store = Arc::new(MemoryStore::new());
    let address = serve_central(store.clone()).await;

    let account = store.register_account("alice", false).await;
    let character = store
        .create_character(account.id, "alice")
        .await
        .expect("create character");
    let ticket = AuthorizationTicket::issue(
        "Login",
        "Central",
        account.id,
        account.name.as_str(),
        character.id,
        None,
    );
    store.persist_ticket(&ticket).await.expect("persist ticket");

    let client = GameClient::new("alice", Arc::new(WsConnector), ClientConfig::default());
    let id = client
        .connect_central(ServerAddress {
            name: "Central".into(),
            address,
        })
        .await
        .expect("login over websocket");
    assert_eq!(id, character.id);

    let games = client.list_games().await.expect("listing");
    assert!(games.is_empty());
    client.disconnect().await;
}

// =========================================================================
// Protocol violations
// =========================================================================

#[tokio::test]
async fn test_ws_malformed_frame_disconnects_with_reason() {
    let address = serve_central(Arc::new(MemoryStore::new())).await;
    let (mut ws, _) = connect_async(address.as_str()).await.expect("connect");

    ws.send(Message::Text("not a packet".into()))
        .await
        .expect("send");

    let codec = JsonCodec;
    let reason = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(message)) = ws.next().await {
            let bytes = match message {
                Message::Binary(data) => data.to_vec(),
                Message::Text(text) => text.as_bytes().to_vec(),
                _ => continue,
            };
            if let Ok(Packet {
                payload: Payload::Disconnect { reason },
                ..
            }) = codec.decode::<Packet>(&bytes)
            {
                return Some(reason);
            }
        }
        None
    })
    .await
    .expect("disconnect should arrive in time")
    .expect("server should send a disconnect packet");

    assert!(reason.starts_with("malformed packet"), "got {reason}");
}
