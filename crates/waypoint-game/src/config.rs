//! Game-layer configuration.

use std::time::Duration;

use tracing::warn;

/// Settings shared by every game a node hosts.
#[derive(Debug, Clone, PartialEq)]
pub struct GameConfig {
    /// Chat/info lines each game keeps. Default: 100.
    pub message_log_capacity: usize,
    /// How long an abandoned lobby survives before purge. Default: 60 s.
    pub abandoned_lobby_purge: Duration,
    /// How long an abandoned started game survives. Default: 300 s.
    pub abandoned_started_purge: Duration,
    /// Interval of the directory purge sweep. Default: 10 s.
    pub directory_sweep_interval: Duration,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            message_log_capacity: 100,
            abandoned_lobby_purge: Duration::from_secs(60),
            abandoned_started_purge: Duration::from_secs(300),
            directory_sweep_interval: Duration::from_secs(10),
        }
    }
}

impl GameConfig {
    pub fn validated(mut self) -> Self {
        if self.message_log_capacity == 0 {
            warn!("message_log_capacity of zero, using 1");
            self.message_log_capacity = 1;
        }
        self
    }

    /// Purge window for an abandoned game in the given phase.
    pub fn purge_window(&self, started: bool) -> chrono::Duration {
        let window = if started {
            self.abandoned_started_purge
        } else {
            self.abandoned_lobby_purge
        };
        chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
    }
}
