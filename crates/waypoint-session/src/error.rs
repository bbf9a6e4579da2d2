//! Error types for the session layer.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use waypoint_protocol::{CharacterId, ConnectionId};

/// Errors raised by the durable store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// The store refused the write (duplicate key, constraint).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached. The transaction was rolled back.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// Errors from the session and connection registries.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `max_connections` live connections are already tracked.
    #[error("connection limit reached ({max})")]
    CapacityExceeded { max: usize },

    /// No tracked connection has this id.
    #[error("connection {0} is not tracked")]
    UnknownConnection(ConnectionId),

    /// The link died before it could be tracked.
    #[error("connection from {0} is already closed")]
    ConnectionClosed(SocketAddr),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a presented ticket was refused. Each reason is reported distinctly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketRejection {
    /// No ticket is stored for the account.
    #[error("no authorization ticket for account")]
    Absent,

    /// The ticket was issued for a different server.
    #[error("ticket targets '{expected}', presented to '{presented}'")]
    TargetMismatch { expected: String, presented: String },

    /// The ticket's lifetime has passed.
    #[error("ticket issued {authorized_on} has expired")]
    Expired { authorized_on: DateTime<Utc> },

    /// The account profile could not be loaded.
    #[error("account load failed: {0}")]
    AccountLoad(StoreError),

    /// The ticket names a character that could not be loaded.
    #[error("character {id} load failed: {source}")]
    CharacterLoad { id: CharacterId, source: StoreError },

    /// The store failed while fetching the ticket itself.
    #[error("ticket lookup failed: {0}")]
    Store(StoreError),
}
