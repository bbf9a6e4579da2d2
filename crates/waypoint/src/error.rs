//! Unified error type for Waypoint nodes and clients.

use waypoint_game::GameError;
use waypoint_protocol::ProtocolError;
use waypoint_session::{SessionError, StoreError, TicketRejection};
use waypoint_sweep::SweepError;
use waypoint_transport::TransportError;

use crate::ConfigError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` conversions let `?` lift sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum WaypointError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ticket(#[from] TicketRejection),

    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    /// The remote side answered a request negatively.
    #[error("rejected: {0}")]
    Rejected(String),

    /// No answer arrived in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The link closed while a request was outstanding.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The call needs state the caller has not established yet.
    #[error("{0}")]
    NotReady(String),
}
