//! Packet dispatch tables and request/reply correlation.
//!
//! Every connection owns a [`DispatchTable`]; every live game owns another
//! one for in-match traffic. A table holds two maps keyed by
//! `(PacketType, Subtype)`:
//!
//! - **requests** — unsolicited packets and requests, keyed by the packet's
//!   own type/subtype;
//! - **replies** — keyed by the type/subtype of the request being answered
//!   (the reply's `reply_to`), so a handler registered for "reply to X"
//!   only ever sees replies to X.
//!
//! Handler failures and panics are contained: they are logged with the
//! packet key and the handler's type name and the connection stays up. A
//! packet nobody routes is a protocol violation and kills the link.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use crate::{Packet, PacketLink, PacketType, ProtocolError, Subtype};

/// Dispatch key.
pub type RouteKey = (PacketType, Subtype);

/// Error a handler reports back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type HandlerResult = Result<(), HandlerError>;

/// Something that can process a routed packet.
pub trait PacketHandler<Ctx>: Send + Sync + 'static {
    fn handle(&self, ctx: Arc<Ctx>, packet: Packet) -> BoxFuture<'static, HandlerResult>;

    /// Name used in logs when the handler fails.
    fn name(&self) -> &str;
}

/// Shared handler reference. Registration identity is pointer identity.
pub type Handler<Ctx> = Arc<dyn PacketHandler<Ctx>>;

struct FnHandler<F> {
    name: String,
    f: F,
}

impl<Ctx, F, Fut> PacketHandler<Ctx> for FnHandler<F>
where
    Ctx: Send + Sync + 'static,
    F: Fn(Arc<Ctx>, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: Arc<Ctx>, packet: Packet) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(ctx, packet))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps an async closure as a [`Handler`], named after the closure type.
pub fn handler<Ctx, F, Fut>(f: F) -> Handler<Ctx>
where
    Ctx: Send + Sync + 'static,
    F: Fn(Arc<Ctx>, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    named_handler(std::any::type_name::<F>(), f)
}

/// Wraps an async closure as a [`Handler`] with an explicit log name.
pub fn named_handler<Ctx, F, Fut>(name: impl Into<String>, f: F) -> Handler<Ctx>
where
    Ctx: Send + Sync + 'static,
    F: Fn(Arc<Ctx>, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one handler ran; `failures` of them returned an error or
    /// panicked.
    Handled { failures: usize },
    /// No table routes the packet; the link has been killed.
    Unroutable,
}

struct Routes<Ctx> {
    requests: HashMap<RouteKey, Vec<Handler<Ctx>>>,
    replies: HashMap<RouteKey, Vec<Handler<Ctx>>>,
}

/// Two-sided subtype → handler table.
pub struct DispatchTable<Ctx> {
    routes: RwLock<Routes<Ctx>>,
}

impl<Ctx> Default for DispatchTable<Ctx> {
    fn default() -> Self {
        Self {
            routes: RwLock::new(Routes {
                requests: HashMap::new(),
                replies: HashMap::new(),
            }),
        }
    }
}

fn add<Ctx>(map: &mut HashMap<RouteKey, Vec<Handler<Ctx>>>, key: RouteKey, h: Handler<Ctx>) -> bool {
    let list = map.entry(key).or_default();
    if list.iter().any(|existing| Arc::ptr_eq(existing, &h)) {
        return false;
    }
    list.push(h);
    true
}

fn remove<Ctx>(map: &mut HashMap<RouteKey, Vec<Handler<Ctx>>>, key: RouteKey, h: &Handler<Ctx>) -> bool {
    let Some(list) = map.get_mut(&key) else {
        return false;
    };
    let before = list.len();
    list.retain(|existing| !Arc::ptr_eq(existing, h));
    let removed = list.len() != before;
    if list.is_empty() {
        map.remove(&key);
    }
    removed
}

impl<Ctx: Send + Sync + 'static> DispatchTable<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request/notification handler. Returns `false` if this exact
    /// handler was already registered for the key.
    pub async fn register(&self, kind: PacketType, subtype: Subtype, h: Handler<Ctx>) -> bool {
        add(&mut self.routes.write().await.requests, (kind, subtype), h)
    }

    /// Removes a request handler. Returns `false` if it was not registered.
    pub async fn unregister(&self, kind: PacketType, subtype: Subtype, h: &Handler<Ctx>) -> bool {
        remove(&mut self.routes.write().await.requests, (kind, subtype), h)
    }

    /// Adds a handler for replies to requests of `(kind, subtype)`.
    pub async fn register_reply(&self, kind: PacketType, subtype: Subtype, h: Handler<Ctx>) -> bool {
        add(&mut self.routes.write().await.replies, (kind, subtype), h)
    }

    pub async fn unregister_reply(
        &self,
        kind: PacketType,
        subtype: Subtype,
        h: &Handler<Ctx>,
    ) -> bool {
        remove(&mut self.routes.write().await.replies, (kind, subtype), h)
    }

    /// Handlers that would receive `packet`, cloned out of the lock.
    pub async fn handlers_for(&self, packet: &Packet) -> Vec<Handler<Ctx>> {
        let routes = self.routes.read().await;
        let found = match packet.reply_to {
            Some(r) => routes.replies.get(&(r.kind, r.subtype)),
            None => routes.requests.get(&(packet.kind, packet.subtype())),
        };
        found.cloned().unwrap_or_default()
    }

    /// Whether any handler would receive `packet`.
    pub async fn routes(&self, packet: &Packet) -> bool {
        !self.handlers_for(packet).await.is_empty()
    }

    /// Dispatches through this table alone.
    pub async fn dispatch(
        &self,
        ctx: Arc<Ctx>,
        link: &dyn PacketLink,
        packet: Packet,
    ) -> DispatchOutcome {
        dispatch_layered(&[self], ctx, link, packet).await
    }
}

/// Dispatches `packet` to the first table in `layers` that routes it.
///
/// Connections pass `[connection_table, game_table]` so in-match traffic
/// falls through to the game the peer is in.
pub async fn dispatch_layered<Ctx: Send + Sync + 'static>(
    layers: &[&DispatchTable<Ctx>],
    ctx: Arc<Ctx>,
    link: &dyn PacketLink,
    packet: Packet,
) -> DispatchOutcome {
    let mut handlers = Vec::new();
    for table in layers {
        handlers = table.handlers_for(&packet).await;
        if !handlers.is_empty() {
            break;
        }
    }

    if handlers.is_empty() {
        let reason = match packet.reply_to {
            Some(r) => format!(
                "unroutable reply to {:?}/{:?} (carried as {:?}/{:?})",
                r.kind,
                r.subtype,
                packet.kind,
                packet.subtype()
            ),
            None => format!("unroutable packet {:?}/{:?}", packet.kind, packet.subtype()),
        };
        tracing::warn!(
            conn_id = %link.id(),
            kind = ?packet.kind,
            subtype = ?packet.subtype(),
            %reason,
            "protocol violation"
        );
        link.kill(&reason);
        return DispatchOutcome::Unroutable;
    }

    let mut failures = 0;
    for h in &handlers {
        let fut = {
            let h = Arc::clone(h);
            let ctx = Arc::clone(&ctx);
            let packet = packet.clone();
            async move { h.handle(ctx, packet).await }
        };
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::warn!(
                    conn_id = %link.id(),
                    kind = ?packet.kind,
                    subtype = ?packet.subtype(),
                    handler = h.name(),
                    error = %e,
                    "packet handler failed"
                );
            }
            Err(_) => {
                failures += 1;
                tracing::error!(
                    conn_id = %link.id(),
                    kind = ?packet.kind,
                    subtype = ?packet.subtype(),
                    handler = h.name(),
                    "packet handler panicked"
                );
            }
        }
    }

    link.on_after_packet_processed(&packet);
    DispatchOutcome::Handled { failures }
}
