//! TTL cache of loaded characters.
//!
//! Lets a Content server re-admit a known participant without a store
//! round-trip. Entries expire after a bounded lifetime unless renewed;
//! the node renews the active character on every keep-alive and may pin
//! an entry with [`CacheLifetime::Pinned`] until it is uncached.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use waypoint_protocol::{CharacterId, CharacterInfo};

use crate::SessionConfig;
use crate::config::to_chrono;

/// When a cache entry stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    At(DateTime<Utc>),
    Never,
}

impl Expiry {
    pub fn has_passed(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::At(at) => *at < now,
            Self::Never => false,
        }
    }
}

/// Requested lifetime for a cache insert or renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLifetime {
    /// The cache's configured default.
    Default,
    For(Duration),
    /// Never expires; removed only by [`CharacterCache::uncache`].
    Pinned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedCharacter {
    pub character: CharacterInfo,
    pub host_server: String,
    pub expires: Expiry,
}

pub struct CharacterCache {
    default_lifetime: Duration,
    entries: Mutex<HashMap<CharacterId, CachedCharacter>>,
}

impl CharacterCache {
    /// `default_lifetime` is clamped to
    /// [`SessionConfig::MIN_CACHE_LIFETIME`].
    pub fn new(default_lifetime: Duration) -> Self {
        let default_lifetime = if default_lifetime < SessionConfig::MIN_CACHE_LIFETIME {
            warn!(
                configured_secs = default_lifetime.as_secs(),
                "character cache lifetime below minimum, clamping"
            );
            SessionConfig::MIN_CACHE_LIFETIME
        } else {
            default_lifetime
        };
        Self {
            default_lifetime,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.character_cache_lifetime)
    }

    pub fn default_lifetime(&self) -> Duration {
        self.default_lifetime
    }

    /// A lifetime that runs past the representable range never expires.
    fn expiry(&self, lifetime: CacheLifetime, now: DateTime<Utc>) -> Expiry {
        let d = match lifetime {
            CacheLifetime::Default => self.default_lifetime,
            CacheLifetime::For(d) => d,
            CacheLifetime::Pinned => return Expiry::Never,
        };
        now.checked_add_signed(to_chrono(d))
            .map_or(Expiry::Never, Expiry::At)
    }

    /// The cached character, if present. Expired-but-unswept entries are
    /// still returned.
    pub async fn get(&self, id: CharacterId) -> Option<CharacterInfo> {
        self.entries
            .lock()
            .await
            .get(&id)
            .map(|e| e.character.clone())
    }

    pub async fn entry(&self, id: CharacterId) -> Option<CachedCharacter> {
        self.entries.lock().await.get(&id).cloned()
    }

    pub async fn cache(&self, character: CharacterInfo, host: &str, lifetime: CacheLifetime) {
        self.cache_at(character, host, lifetime, Utc::now()).await
    }

    /// Inserts or renews. A renewal keeps the entry and replaces its data,
    /// host and expiry.
    pub async fn cache_at(
        &self,
        character: CharacterInfo,
        host: &str,
        lifetime: CacheLifetime,
        now: DateTime<Utc>,
    ) {
        let expires = self.expiry(lifetime, now);
        let id = character.id;
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.character = character;
                entry.host_server = host.to_string();
                entry.expires = expires;
            }
            None => {
                entries.insert(
                    id,
                    CachedCharacter {
                        character,
                        host_server: host.to_string(),
                        expires,
                    },
                );
            }
        }
        debug!(character = %id, host, ?expires, "character cached");
    }

    pub async fn update_expiration(&self, id: CharacterId, lifetime: CacheLifetime) -> bool {
        self.update_expiration_at(id, lifetime, Utc::now()).await
    }

    /// Renews an existing entry. Returns `false` if it is not cached.
    pub async fn update_expiration_at(
        &self,
        id: CharacterId,
        lifetime: CacheLifetime,
        now: DateTime<Utc>,
    ) -> bool {
        let expires = self.expiry(lifetime, now);
        match self.entries.lock().await.get_mut(&id) {
            Some(entry) => {
                entry.expires = expires;
                true
            }
            None => false,
        }
    }

    pub async fn uncache(&self, id: CharacterId) -> Option<CachedCharacter> {
        self.entries.lock().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Removes every entry whose expiry lies before `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.expires.has_passed(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "character cache swept");
        }
        removed
    }
}
