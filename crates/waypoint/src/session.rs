//! Handlers every node registers: ticket login and keep-alive.

use std::sync::Arc;

use tracing::{info, warn};
use waypoint_protocol::{
    CharacterId, HandlerError, HandlerResult, Packet, PacketType, Payload, ProtocolError, Subtype,
    named_handler,
};
use waypoint_session::{CacheLifetime, SessionRecord};

use crate::node::{Peer, Route};

pub(crate) fn routes() -> Vec<Route> {
    vec![
        (
            PacketType::Login,
            Subtype::Login,
            named_handler("session::login", on_login),
        ),
        (
            PacketType::Generic,
            Subtype::KeepAlive,
            named_handler("session::keep_alive", on_keep_alive),
        ),
    ]
}

/// Error for a handler that was routed a payload it does not handle.
pub(crate) fn unexpected(packet: &Packet) -> HandlerError {
    HandlerError::Protocol(ProtocolError::InvalidPacket(format!(
        "unexpected payload {:?} on {:?}",
        packet.subtype(),
        packet.kind
    )))
}

/// Validates the presented ticket against this node, authorizes the
/// session on success and, on a Content node, admits the character into
/// the ticket's target game.
async fn on_login(peer: Arc<Peer>, packet: Packet) -> HandlerResult {
    let Payload::Login { account_name } = &packet.payload else {
        return Err(unexpected(&packet));
    };
    let node = Arc::clone(peer.node());

    let ctx = match node.tickets().validate_ticket(account_name, node.name()).await {
        Ok(ctx) => ctx,
        Err(rejection) => {
            warn!(
                node = %node.name(),
                account = %account_name,
                conn_id = %peer.link.id(),
                %rejection,
                "login rejected"
            );
            peer.reply(
                &packet,
                Payload::LoginResult {
                    accepted: false,
                    message: rejection.to_string(),
                    account_id: None,
                    character_id: CharacterId::NONE,
                },
            );
            return Ok(());
        }
    };

    let record =
        SessionRecord::new(&ctx.account, ctx.ticket.clone()).with_connection(Arc::clone(&peer.link));
    node.sessions().authorize(record, false).await;
    peer.log_in(ctx.account.clone(), ctx.character.clone()).await;

    info!(
        node = %node.name(),
        account = %ctx.account.name,
        character = %ctx.character_id(),
        conn_id = %peer.link.id(),
        assisted = ctx.assisted,
        "login accepted"
    );
    peer.reply(
        &packet,
        Payload::LoginResult {
            accepted: true,
            message: String::new(),
            account_id: Some(ctx.account.id),
            character_id: ctx.character_id(),
        },
    );

    if let Some(content) = node.content() {
        content.admit(&peer, &ctx).await;
    }
    Ok(())
}

/// Renews the session and the active character's cache entry.
async fn on_keep_alive(peer: Arc<Peer>, _packet: Packet) -> HandlerResult {
    let Some((account, character)) = peer.session().await else {
        return Ok(());
    };
    let node = peer.node();
    node.sessions().renew(&account.name).await;
    if let Some(character) = character {
        node.cache()
            .update_expiration(character.id, CacheLifetime::Default)
            .await;
    }
    Ok(())
}
