//! Session layer for Waypoint.
//!
//! Keeps a player's authorization consistent while they move between
//! server processes:
//!
//! 1. **Tickets** ([`TicketAuthority`]): issued by the server that made a
//!    placement decision, validated once by the target.
//! 2. **Sessions** ([`SessionRegistry`]): one record per account, expired
//!    by sweep, pre-empted by a newer login.
//! 3. **Connections** ([`ConnectionRegistry`]): live links by id and
//!    endpoint, capacity-limited, with parent-link notifications.
//! 4. **Characters** ([`CharacterCache`]): TTL cache avoiding store
//!    round-trips on re-admission.
//!
//! The durable side is the [`DurableStore`] trait; [`MemoryStore`] backs
//! tests and single-process clusters.
//!
//! ```text
//! Game layer (above)     ← admits characters the session layer vouched for
//!     ↕
//! Session layer (this crate)
//!     ↕
//! Protocol layer (below) ← tickets, PacketLink, CharacterInfo
//! ```

mod cache;
mod config;
mod connections;
mod error;
mod observers;
mod registry;
mod store;
mod tickets;

pub use cache::{CacheLifetime, CachedCharacter, CharacterCache, Expiry};
pub use config::SessionConfig;
pub use connections::{
    ConnectionRegistry, ParentLinkEvent, REASON_ENDPOINT_REPLACED, RemovedConnection,
};
pub use error::{SessionError, StoreError, TicketRejection};
pub use observers::{Subscribers, SubscriptionId};
pub use registry::{
    ConnectionLoss, REASON_DUPLICATE_LOGIN, REASON_TICKET_EXPIRED, SessionRecord, SessionRegistry,
};
pub use store::{Account, DurableStore, MemoryStore};
pub use tickets::{SessionContext, TicketAuthority};
