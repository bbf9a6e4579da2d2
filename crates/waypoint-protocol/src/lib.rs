//! Wire protocol for Waypoint.
//!
//! Everything two nodes (or a node and a client) agree on lives here:
//!
//! - **Identity** ([`AccountId`], [`CharacterId`], [`GameId`]) and the
//!   [`AuthorizationTicket`] carried across a server handoff.
//! - **Snapshots** ([`CharacterInfo`], [`GameSnapshot`], [`GameListEntry`],
//!   ...) with one fixed shape per entity.
//! - **Packets** ([`Packet`], [`Payload`], [`Subtype`]) and the
//!   [`PacketLink`] contract registries and flows send through.
//! - **Dispatch** ([`DispatchTable`]) with request/reply correlation.
//! - **Codec** ([`Codec`], [`JsonCodec`]) for turning packets into bytes.
//!
//! ```text
//! Transport (bytes) → Codec (Packet) → DispatchTable → handlers
//! ```

mod codec;
mod dispatch;
mod error;
mod ids;
mod link;
mod model;
mod packet;
mod ticket;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use dispatch::{
    DispatchOutcome, DispatchTable, Handler, HandlerError, HandlerResult, PacketHandler, RouteKey,
    dispatch_layered, handler, named_handler,
};
pub use error::ProtocolError;
pub use ids::{AccountId, CharacterId, GameId};
pub use link::{ChannelLink, LinkEvent, PacketLink};
pub use model::{
    CharacterInfo, GameDescriptor, GameListEntry, GameOptions, GameSnapshot, GameState,
    LOAD_PERCENT, Properties, PropertyValue, ServerAddress,
};
pub use packet::{Packet, PacketRef, PacketType, Payload, Subtype};
pub use ticket::AuthorizationTicket;
pub use waypoint_transport::ConnectionId;
