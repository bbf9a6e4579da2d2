//! The session registry: who is authorized on this server right now.
//!
//! One record per account name (case-insensitive). Authorizing an account
//! that already has a record pre-empts it synchronously: the old
//! connection is killed before the new record is inserted, so two live
//! sessions for one account are never observable.
//!
//! Records expire `ticket_lifetime` after their last authorization or
//! keep-alive. [`SessionRegistry::sweep_at`] evicts expired non-admin
//! records; the node runs it on a `waypoint-sweep` timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use waypoint_protocol::{AccountId, AuthorizationTicket, CharacterId, ConnectionId, PacketLink};

use crate::{Account, DurableStore, SessionConfig};

/// Kill reason for a connection pre-empted by a newer login.
pub const REASON_DUPLICATE_LOGIN: &str = "logging in from another client";

/// Kill reason for a connection whose session expired.
pub const REASON_TICKET_EXPIRED: &str = "Auth ticket expired";

/// One authorized account on this server.
#[derive(Clone)]
pub struct SessionRecord {
    pub account_name: String,
    pub account_id: AccountId,
    pub is_admin: bool,
    /// Live connection, absent between a handoff and the client's login.
    pub connection: Option<Arc<dyn PacketLink>>,
    pub character: CharacterId,
    /// Ticket that authorized this record.
    pub ticket: AuthorizationTicket,
    /// Set by the registry on authorize and renew.
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(account: &Account, ticket: AuthorizationTicket) -> Self {
        Self {
            account_name: account.name.clone(),
            account_id: account.id,
            is_admin: account.is_admin,
            connection: None,
            character: ticket.character_id,
            expires_at: ticket.authorized_on,
            ticket,
        }
    }

    /// Record for a ticket whose account profile has not been loaded.
    pub fn from_ticket(ticket: AuthorizationTicket) -> Self {
        Self {
            account_name: ticket.account_name.clone(),
            account_id: ticket.account_id,
            is_admin: false,
            connection: None,
            character: ticket.character_id,
            expires_at: ticket.authorized_on,
            ticket,
        }
    }

    pub fn with_connection(mut self, link: Arc<dyn PacketLink>) -> Self {
        self.connection = Some(link);
        self
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id())
    }

    pub fn account(&self) -> Account {
        Account {
            id: self.account_id,
            name: self.account_name.clone(),
            is_admin: self.is_admin,
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("account_name", &self.account_name)
            .field("account_id", &self.account_id)
            .field("is_admin", &self.is_admin)
            .field("connection", &self.connection_id())
            .field("character", &self.character)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What [`SessionRegistry::connection_lost`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLoss {
    /// No record for the account referenced that connection.
    Untracked,
    /// Admin record kept with its connection reference cleared.
    Cleared,
    /// Non-admin record removed.
    Evicted,
}

fn key(account_name: &str) -> String {
    account_name.to_lowercase()
}

/// Process-wide registry of authorized accounts for one server.
pub struct SessionRegistry {
    server_name: String,
    ticket_lifetime: chrono::Duration,
    store: Arc<dyn DurableStore>,
    records: Mutex<HashMap<String, SessionRecord>>,
    nuke: AtomicBool,
}

impl SessionRegistry {
    pub fn new(
        server_name: impl Into<String>,
        config: &SessionConfig,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            ticket_lifetime: config.ticket_lifetime_chrono(),
            store,
            records: Mutex::new(HashMap::new()),
            nuke: AtomicBool::new(false),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn ticket_lifetime(&self) -> chrono::Duration {
        self.ticket_lifetime
    }

    /// Expiry for a record authorized or renewed at `now`.
    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ticket_lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Inserts `record`, pre-empting any existing record for the account.
    ///
    /// Returns `false` only when `persist` was requested and the store
    /// write failed; the in-memory record is inserted regardless.
    pub async fn authorize(&self, record: SessionRecord, persist: bool) -> bool {
        self.authorize_at(record, persist, Utc::now()).await
    }

    pub async fn authorize_at(
        &self,
        mut record: SessionRecord,
        persist: bool,
        now: DateTime<Utc>,
    ) -> bool {
        record.expires_at = self.deadline(now);
        let account = record.account_name.clone();
        let ticket = persist.then(|| record.ticket.clone());
        let new_conn = record.connection_id();

        {
            let mut records = self.records.lock().await;
            if let Some(old) = records.remove(&key(&account)) {
                if let Some(link) = old.connection.as_ref().filter(|l| Some(l.id()) != new_conn) {
                    info!(
                        %account,
                        old_conn = %link.id(),
                        server = %self.server_name,
                        "pre-empting existing session"
                    );
                    link.kill(REASON_DUPLICATE_LOGIN);
                }
            }
            records.insert(key(&account), record);
        }

        debug!(%account, server = %self.server_name, persist, "session authorized");

        match ticket {
            Some(ticket) => match self.store.persist_ticket(&ticket).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(%account, error = %e, "failed to persist authorization ticket");
                    false
                }
            },
            None => true,
        }
    }

    /// Removes the account's record. With `persist`, the durable session is
    /// cleared too so a stale ticket cannot be replayed.
    pub async fn unauthorize(&self, account_name: &str, persist: bool) -> Option<SessionRecord> {
        let removed = self.records.lock().await.remove(&key(account_name));
        if persist {
            if let Err(e) = self.store.unauthorize_session(account_name).await {
                warn!(account = %account_name, error = %e, "failed to clear durable session");
            }
        }
        if removed.is_some() {
            debug!(account = %account_name, server = %self.server_name, "session unauthorized");
        }
        removed
    }

    /// Extends the account's expiry by a full lifetime from now.
    pub async fn renew(&self, account_name: &str) -> bool {
        self.renew_at(account_name, Utc::now()).await
    }

    pub async fn renew_at(&self, account_name: &str, now: DateTime<Utc>) -> bool {
        match self.records.lock().await.get_mut(&key(account_name)) {
            Some(record) => {
                record.expires_at = self.deadline(now);
                true
            }
            None => false,
        }
    }

    /// Records that `conn` closed. Only acts if the account's record still
    /// points at that connection: admin records keep living without it,
    /// others are evicted.
    pub async fn connection_lost(&self, account_name: &str, conn: ConnectionId) -> ConnectionLoss {
        let mut records = self.records.lock().await;
        let k = key(account_name);
        let Some(record) = records.get_mut(&k) else {
            return ConnectionLoss::Untracked;
        };
        if record.connection_id() != Some(conn) {
            return ConnectionLoss::Untracked;
        }
        if record.is_admin {
            record.connection = None;
            ConnectionLoss::Cleared
        } else {
            records.remove(&k);
            debug!(account = %account_name, %conn, "session evicted after connection loss");
            ConnectionLoss::Evicted
        }
    }

    pub async fn get(&self, account_name: &str) -> Option<SessionRecord> {
        self.records.lock().await.get(&key(account_name)).cloned()
    }

    pub async fn contains(&self, account_name: &str) -> bool {
        self.records.lock().await.contains_key(&key(account_name))
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// While set, every sweep evicts all non-admin records.
    pub fn set_nuke(&self, on: bool) {
        self.nuke.store(on, Ordering::Release);
    }

    pub fn is_nuking(&self) -> bool {
        self.nuke.load(Ordering::Acquire)
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Evicts non-admin records whose expiry lies before `now` (all of
    /// them when nuking), killing their connections. Returns the count.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let nuke = self.is_nuking();
        let evicted: Vec<SessionRecord> = {
            let mut records = self.records.lock().await;
            let stale: Vec<String> = records
                .iter()
                .filter(|(_, r)| !r.is_admin && (nuke || r.expires_at < now))
                .map(|(k, _)| k.clone())
                .collect();
            stale.iter().filter_map(|k| records.remove(k)).collect()
        };

        for record in &evicted {
            info!(
                account = %record.account_name,
                server = %self.server_name,
                nuke,
                "session expired"
            );
            if let Some(link) = &record.connection {
                link.kill(REASON_TICKET_EXPIRED);
            }
        }
        evicted.len()
    }

    /// Runs one pass with the nuke flag set, synchronously.
    pub async fn nuke_all(&self) -> usize {
        self.set_nuke(true);
        let n = self.sweep().await;
        self.set_nuke(false);
        n
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use waypoint_protocol::{ChannelLink, LinkEvent};

    use super::*;
    use crate::MemoryStore;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn registry(store: Arc<MemoryStore>) -> SessionRegistry {
        SessionRegistry::new("Content1", &SessionConfig::default(), store)
    }

    fn account(name: &str, is_admin: bool) -> Account {
        Account {
            id: AccountId::new_v4(),
            name: name.into(),
            is_admin,
        }
    }

    fn record(account: &Account) -> SessionRecord {
        let ticket = AuthorizationTicket::issue(
            "Central",
            "Content1",
            account.id,
            account.name.clone(),
            CharacterId(1),
            None,
        );
        SessionRecord::new(account, ticket)
    }

    #[tokio::test]
    async fn test_authorize_twice_kills_first_connection() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let alice = account("alice", false);
        let (first, mut first_rx) = ChannelLink::new(addr(1));
        let first = Arc::new(first);
        let (second, _rx2) = ChannelLink::new(addr(2));
        let second = Arc::new(second);

        assert!(reg.authorize(record(&alice).with_connection(first.clone()), false).await);
        assert!(reg.authorize(record(&alice).with_connection(second.clone()), false).await);

        assert_eq!(reg.len().await, 1);
        assert!(!first.is_alive());
        assert_eq!(first.kill_reason(), Some(REASON_DUPLICATE_LOGIN));
        assert!(second.is_alive());
        assert_eq!(
            first_rx.try_recv().ok(),
            Some(LinkEvent::Closed {
                reason: REASON_DUPLICATE_LOGIN.into()
            })
        );
        assert_eq!(reg.get("ALICE").await.unwrap().connection_id(), Some(second.id()));
    }

    #[tokio::test]
    async fn test_authorize_same_connection_does_not_kill_it() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let alice = account("alice", false);
        let (link, _rx) = ChannelLink::new(addr(1));
        let link = Arc::new(link);
        reg.authorize(record(&alice).with_connection(link.clone()), false).await;
        reg.authorize(record(&alice).with_connection(link.clone()), false).await;
        assert!(link.is_alive());
    }

    #[tokio::test]
    async fn test_authorize_persist_writes_ticket() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        let alice = account("alice", false);
        assert!(reg.authorize(record(&alice), true).await);
        assert!(store.load_ticket_for_account("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authorize_persist_failure_returns_false() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        store.set_offline(true);
        assert!(!reg.authorize(record(&account("alice", false)), true).await);
        assert!(reg.contains("alice").await);
    }

    #[tokio::test]
    async fn test_unauthorize_persist_clears_durable_ticket() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        reg.authorize(record(&account("alice", false)), true).await;
        assert!(reg.unauthorize("Alice", true).await.is_some());
        assert!(store.load_ticket_for_account("alice").await.unwrap().is_none());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_at_evicts_expired_non_admin_only() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let (user_link, _u) = ChannelLink::new(addr(1));
        let user_link = Arc::new(user_link);
        let (admin_link, _a) = ChannelLink::new(addr(2));
        let admin_link = Arc::new(admin_link);

        reg.authorize_at(record(&account("user", false)).with_connection(user_link.clone()), false, now)
            .await;
        reg.authorize_at(record(&account("root", true)).with_connection(admin_link.clone()), false, now)
            .await;

        let later = now + reg.ticket_lifetime() + chrono::Duration::seconds(1);
        assert_eq!(reg.sweep_at(now).await, 0);
        assert_eq!(reg.sweep_at(later).await, 1);
        assert_eq!(user_link.kill_reason(), Some(REASON_TICKET_EXPIRED));
        assert!(admin_link.is_alive());
        assert!(reg.contains("root").await);
    }

    #[tokio::test]
    async fn test_renew_at_postpones_expiry() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let half = reg.ticket_lifetime() / 2;
        reg.authorize_at(record(&account("alice", false)), false, now).await;
        assert!(reg.renew_at("alice", now + half).await);
        let past_original = now + reg.ticket_lifetime() + chrono::Duration::seconds(1);
        assert_eq!(reg.sweep_at(past_original).await, 0);
        assert!(!reg.renew_at("nobody", now).await);
    }

    #[tokio::test]
    async fn test_authorize_at_unbounded_lifetime_saturates() {
        let config = SessionConfig {
            ticket_lifetime: std::time::Duration::MAX,
            ..SessionConfig::default()
        };
        let reg = SessionRegistry::new("Content1", &config, Arc::new(MemoryStore::new()));
        let now = Utc::now();
        reg.authorize_at(record(&account("alice", false)), false, now).await;
        assert!(reg.renew_at("alice", now).await);
        assert_eq!(reg.get("alice").await.unwrap().expires_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(reg.sweep_at(now + chrono::Duration::days(365)).await, 0);
    }

    #[tokio::test]
    async fn test_nuke_all_evicts_fresh_sessions() {
        let reg = registry(Arc::new(MemoryStore::new()));
        reg.authorize(record(&account("a", false)), false).await;
        reg.authorize(record(&account("b", false)), false).await;
        reg.authorize(record(&account("admin", true)), false).await;
        assert_eq!(reg.nuke_all().await, 2);
        assert_eq!(reg.len().await, 1);
        assert!(!reg.is_nuking());
    }

    #[tokio::test]
    async fn test_connection_lost_only_for_matching_connection() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let (link, _rx) = ChannelLink::new(addr(1));
        let link = Arc::new(link);
        let (other, _rx2) = ChannelLink::new(addr(2));
        reg.authorize(record(&account("alice", false)).with_connection(link.clone()), false)
            .await;

        assert_eq!(reg.connection_lost("alice", other.id()).await, ConnectionLoss::Untracked);
        assert!(reg.contains("alice").await);
        assert_eq!(reg.connection_lost("alice", link.id()).await, ConnectionLoss::Evicted);
        assert!(!reg.contains("alice").await);
    }

    #[tokio::test]
    async fn test_connection_lost_keeps_admin_record() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let (link, _rx) = ChannelLink::new(addr(1));
        let link = Arc::new(link);
        reg.authorize(record(&account("root", true)).with_connection(link.clone()), false)
            .await;
        assert_eq!(reg.connection_lost("root", link.id()).await, ConnectionLoss::Cleared);
        assert!(reg.get("root").await.unwrap().connection.is_none());
    }
}
