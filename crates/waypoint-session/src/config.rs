//! Session-layer timing and limits.

use std::time::Duration;

use tracing::warn;

/// Configuration for the session registry, connection registry and
/// character cache.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long an issued ticket stays valid, and how far a keep-alive
    /// pushes a session's expiry. Default: 300 s.
    pub ticket_lifetime: Duration,
    /// Interval of the ticket-expiry sweep. Default: 15 s.
    pub ticket_sweep_interval: Duration,
    /// Default character-cache lifetime. Default: 5 min, floor 1 min.
    pub character_cache_lifetime: Duration,
    /// Interval of the character-cache sweep. Default: 30 s.
    pub character_cache_sweep_interval: Duration,
    /// Live transport connections allowed at once. Default: 1000.
    pub max_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ticket_lifetime: Duration::from_secs(300),
            ticket_sweep_interval: Duration::from_secs(15),
            character_cache_lifetime: Duration::from_secs(5 * 60),
            character_cache_sweep_interval: Duration::from_secs(30),
            max_connections: 1000,
        }
    }
}

impl SessionConfig {
    /// Shortest character-cache lifetime accepted.
    pub const MIN_CACHE_LIFETIME: Duration = Duration::from_secs(60);

    /// Longest ticket lifetime accepted.
    pub const MAX_TICKET_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.character_cache_lifetime < Self::MIN_CACHE_LIFETIME {
            warn!(
                configured_secs = self.character_cache_lifetime.as_secs(),
                min_secs = Self::MIN_CACHE_LIFETIME.as_secs(),
                "character cache lifetime below minimum, clamping"
            );
            self.character_cache_lifetime = Self::MIN_CACHE_LIFETIME;
        }
        if self.ticket_lifetime.is_zero() {
            warn!("ticket lifetime of zero would reject every ticket, using default");
            self.ticket_lifetime = Self::default().ticket_lifetime;
        }
        if self.ticket_lifetime > Self::MAX_TICKET_LIFETIME {
            warn!(
                configured_secs = self.ticket_lifetime.as_secs(),
                max_secs = Self::MAX_TICKET_LIFETIME.as_secs(),
                "ticket lifetime above maximum, clamping"
            );
            self.ticket_lifetime = Self::MAX_TICKET_LIFETIME;
        }
        if self.max_connections == 0 {
            warn!("max_connections of zero would refuse every client, using default");
            self.max_connections = Self::default().max_connections;
        }
        self
    }

    /// Ticket lifetime as a `chrono` duration for timestamp arithmetic.
    pub fn ticket_lifetime_chrono(&self) -> chrono::Duration {
        to_chrono(self.ticket_lifetime)
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
