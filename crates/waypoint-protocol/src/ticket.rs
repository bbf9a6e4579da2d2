//! Authorization tickets: the value object carried across a server handoff.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, CharacterId, GameId};

/// Grants one account (and optionally one character) entry to one target
/// server.
///
/// Tickets are immutable. Re-authorizing an account produces a new ticket
/// that supersedes the stored one; nothing ever edits a ticket in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationTicket {
    /// Name of the server that granted the ticket.
    pub authorizing_server: String,
    /// Name of the only server allowed to accept the ticket.
    pub target_server: String,
    pub account_id: AccountId,
    pub account_name: String,
    /// `CharacterId::NONE` when the ticket is account-only.
    pub character_id: CharacterId,
    /// Game the holder was admitted to, when the ticket results from a
    /// create/join/quick-match decision.
    #[serde(default)]
    pub target_game: Option<GameId>,
    /// Admission to `target_game` is as an observer.
    #[serde(default)]
    pub as_observer: bool,
    pub authorized_on: DateTime<Utc>,
}

impl AuthorizationTicket {
    /// Issues a ticket stamped with the current time.
    pub fn issue(
        authorizing_server: impl Into<String>,
        target_server: impl Into<String>,
        account_id: AccountId,
        account_name: impl Into<String>,
        character_id: CharacterId,
        target_game: Option<GameId>,
    ) -> Self {
        Self {
            authorizing_server: authorizing_server.into(),
            target_server: target_server.into(),
            account_id,
            account_name: account_name.into(),
            character_id,
            target_game,
            as_observer: false,
            authorized_on: Utc::now(),
        }
    }

    /// Returns a copy admitting its holder as an observer (or not).
    pub fn observing(mut self, as_observer: bool) -> Self {
        self.as_observer = as_observer;
        self
    }

    /// Returns a copy stamped at `authorized_on`.
    pub fn at(mut self, authorized_on: DateTime<Utc>) -> Self {
        self.authorized_on = authorized_on;
        self
    }

    /// Instant after which the ticket is no longer accepted. Saturates at
    /// the latest representable instant.
    pub fn expires_at(&self, lifetime: Duration) -> DateTime<Utc> {
        self.authorized_on
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `true` once `authorized_on + lifetime` lies strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, lifetime: Duration) -> bool {
        self.expires_at(lifetime) < now
    }

    /// Whether the ticket was issued for `server`. Server names compare
    /// case-insensitively everywhere in the cluster.
    pub fn targets(&self, server: &str) -> bool {
        self.target_server.eq_ignore_ascii_case(server)
    }
}
