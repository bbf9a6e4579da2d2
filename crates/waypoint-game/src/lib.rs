//! Game layer for Waypoint.
//!
//! - [`Game`]: one lobby/match with independently locked player and
//!   observer rosters, a state slot, and an event list.
//! - [`GameDirectory`]: the games a Content server hosts, with the
//!   abandonment purge policy.
//! - [`GameListing`]: Central's view of every game in the cluster.
//! - [`MessageLog`]: bounded chat/info log.

mod config;
mod directory;
mod error;
mod event;
mod game;
mod listing;
mod log;

pub use config::GameConfig;
pub use directory::{GameDirectory, PurgeReason, PurgedGame};
pub use error::GameError;
pub use event::GameEvent;
pub use game::{Admission, Concerns, Game};
pub use listing::{GameListing, ListedGame};
pub use log::MessageLog;
