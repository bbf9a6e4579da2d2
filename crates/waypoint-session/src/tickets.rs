//! Ticket issuance and validation.
//!
//! Central issues a ticket after deciding where a client goes next and
//! persists it, so the target Content server can validate it later
//! without a live link to Central. On the target, validation takes one of
//! two paths:
//!
//! - **assisted**: the registry already holds a record for the account
//!   (Central handed the session over on a parent link, or the account is
//!   reconnecting). The record is trusted as is.
//! - **unassisted**: the ticket is loaded from the store and checked for
//!   target and age; the account and character are then loaded and the
//!   character is cached against this server. The ticket is consumed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use waypoint_protocol::{AuthorizationTicket, CharacterId, CharacterInfo, GameId};

use crate::{
    Account, CacheLifetime, CharacterCache, DurableStore, SessionConfig, SessionRegistry,
    StoreError, TicketRejection,
};

/// What a successful validation hands to the login flow.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub account: Account,
    pub character: Option<CharacterInfo>,
    pub ticket: AuthorizationTicket,
    /// `true` when accepted from a live registry record.
    pub assisted: bool,
}

impl SessionContext {
    pub fn character_id(&self) -> CharacterId {
        self.character.as_ref().map(|c| c.id).unwrap_or(CharacterId::NONE)
    }
}

/// Issues and validates tickets on behalf of one server.
pub struct TicketAuthority {
    server_name: String,
    lifetime: chrono::Duration,
    store: Arc<dyn DurableStore>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<CharacterCache>,
}

impl TicketAuthority {
    pub fn new(
        config: &SessionConfig,
        store: Arc<dyn DurableStore>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<CharacterCache>,
    ) -> Self {
        Self {
            server_name: sessions.server_name().to_string(),
            lifetime: config.ticket_lifetime_chrono(),
            store,
            sessions,
            cache,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Issues a ticket from this server to `target` and persists it,
    /// superseding any earlier ticket for the account.
    pub async fn issue_ticket(
        &self,
        target: &str,
        account: &Account,
        character: CharacterId,
        game: Option<GameId>,
        as_observer: bool,
    ) -> Result<AuthorizationTicket, StoreError> {
        let ticket = AuthorizationTicket::issue(
            self.server_name.as_str(),
            target,
            account.id,
            account.name.as_str(),
            character,
            game,
        )
        .observing(as_observer);
        self.store.persist_ticket(&ticket).await?;
        info!(
            account = %account.name,
            %character,
            target,
            game = ?game,
            "authorization ticket issued"
        );
        Ok(ticket)
    }

    pub async fn validate_ticket(
        &self,
        account_name: &str,
        presented_target: &str,
    ) -> Result<SessionContext, TicketRejection> {
        self.validate_ticket_at(account_name, presented_target, Utc::now())
            .await
    }

    /// Validates the ticket `account_name` presents to `presented_target`
    /// as of `now`.
    pub async fn validate_ticket_at(
        &self,
        account_name: &str,
        presented_target: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionContext, TicketRejection> {
        if let Some(record) = self.sessions.get(account_name).await {
            let character = self.character_for(record.character).await?;
            self.consume_if_ours(account_name).await;
            debug!(account = %account_name, server = %self.server_name, "assisted transfer accepted");
            return Ok(SessionContext {
                account: record.account(),
                character,
                ticket: record.ticket,
                assisted: true,
            });
        }

        let ticket = self
            .store
            .load_ticket_for_account(account_name)
            .await
            .map_err(TicketRejection::Store)?
            .ok_or(TicketRejection::Absent)?;

        if !ticket.targets(presented_target) {
            return Err(TicketRejection::TargetMismatch {
                expected: ticket.target_server,
                presented: presented_target.to_string(),
            });
        }
        if ticket.is_expired_at(now, self.lifetime) {
            return Err(TicketRejection::Expired {
                authorized_on: ticket.authorized_on,
            });
        }

        let account = self
            .store
            .load_account(account_name)
            .await
            .map_err(TicketRejection::AccountLoad)?;
        let character = self.character_for(ticket.character_id).await?;

        if let Err(e) = self.store.consume_ticket(account_name).await {
            warn!(account = %account_name, error = %e, "failed to consume ticket");
        }
        debug!(
            account = %account_name,
            server = %self.server_name,
            authorized_by = %ticket.authorizing_server,
            "unassisted transfer accepted"
        );
        Ok(SessionContext {
            account,
            character,
            ticket,
            assisted: false,
        })
    }

    /// Consumes the stored ticket only when it was issued for this server.
    /// A ticket bound for another server belongs to a transfer still in
    /// flight.
    async fn consume_if_ours(&self, account_name: &str) {
        match self.store.load_ticket_for_account(account_name).await {
            Ok(Some(stored)) if stored.targets(&self.server_name) => {
                if let Err(e) = self.store.consume_ticket(account_name).await {
                    warn!(account = %account_name, error = %e, "failed to consume ticket after assisted transfer");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(account = %account_name, error = %e, "failed to load ticket after assisted transfer");
            }
        }
    }

    /// Cached character, or a fresh load that is then cached against this
    /// server.
    async fn character_for(&self, id: CharacterId) -> Result<Option<CharacterInfo>, TicketRejection> {
        if !id.is_some() {
            return Ok(None);
        }
        if let Some(c) = self.cache.get(id).await {
            self.cache
                .update_expiration(id, CacheLifetime::Default)
                .await;
            return Ok(Some(c));
        }
        let character = self
            .store
            .load_character(id)
            .await
            .map_err(|source| TicketRejection::CharacterLoad { id, source })?;
        self.cache
            .cache(character.clone(), &self.server_name, CacheLifetime::Default)
            .await;
        Ok(Some(character))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, SessionRecord};

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<CharacterCache>,
        sessions: Arc<SessionRegistry>,
        authority: TicketAuthority,
    }

    fn fixture(server: &str) -> Fixture {
        let config = SessionConfig::default();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CharacterCache::from_config(&config));
        let sessions = Arc::new(SessionRegistry::new(server, &config, store.clone()));
        let authority = TicketAuthority::new(&config, store.clone(), sessions.clone(), cache.clone());
        Fixture {
            store,
            cache,
            sessions,
            authority,
        }
    }

    async fn seed(store: &MemoryStore, name: &str) -> (Account, CharacterInfo) {
        let account = store.register_account(name, false).await;
        let character = store.create_character(account.id, name).await.unwrap();
        (account, character)
    }

    #[tokio::test]
    async fn test_validate_ticket_unassisted_accepts_and_caches() {
        let f = fixture("Content1");
        let (account, character) = seed(&f.store, "alice").await;
        let ticket = AuthorizationTicket::issue(
            "Central", "Content1", account.id, "alice", character.id, Some(GameId(4)),
        );
        f.store.persist_ticket(&ticket).await.unwrap();

        let ctx = f.authority.validate_ticket("alice", "Content1").await.unwrap();
        assert!(!ctx.assisted);
        assert_eq!(ctx.character_id(), character.id);
        assert_eq!(ctx.ticket.target_game, Some(GameId(4)));
        let cached = f.cache.entry(character.id).await.unwrap();
        assert_eq!(cached.host_server, "Content1");
        assert!(f.store.load_ticket_for_account("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validate_ticket_absent_rejected() {
        let f = fixture("Content1");
        assert_eq!(
            f.authority.validate_ticket("ghost", "Content1").await,
            Err(TicketRejection::Absent)
        );
    }

    #[tokio::test]
    async fn test_validate_ticket_expired_by_one_second_rejected() {
        let f = fixture("Content1");
        let (account, character) = seed(&f.store, "alice").await;
        let now = Utc::now();
        let lifetime = f.sessions.ticket_lifetime();
        let ticket = AuthorizationTicket::issue("Central", "Content1", account.id, "alice", character.id, None)
            .at(now - lifetime - chrono::Duration::seconds(1));
        f.store.persist_ticket(&ticket).await.unwrap();

        assert!(matches!(
            f.authority.validate_ticket_at("alice", "Content1", now).await,
            Err(TicketRejection::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_ticket_other_target_rejected_even_when_fresh() {
        let f = fixture("A");
        let (account, character) = seed(&f.store, "alice").await;
        let ticket = AuthorizationTicket::issue("Central", "B", account.id, "alice", character.id, None);
        f.store.persist_ticket(&ticket).await.unwrap();

        assert_eq!(
            f.authority.validate_ticket("alice", "A").await,
            Err(TicketRejection::TargetMismatch {
                expected: "B".into(),
                presented: "A".into()
            })
        );
    }

    #[tokio::test]
    async fn test_validate_ticket_missing_character_is_character_load() {
        let f = fixture("Content1");
        let account = f.store.register_account("alice", false).await;
        let ticket = AuthorizationTicket::issue("Central", "Content1", account.id, "alice", CharacterId(42), None);
        f.store.persist_ticket(&ticket).await.unwrap();

        assert!(matches!(
            f.authority.validate_ticket("alice", "Content1").await,
            Err(TicketRejection::CharacterLoad { id: CharacterId(42), .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_ticket_missing_account_is_account_load() {
        let f = fixture("Content1");
        let ticket = AuthorizationTicket::issue(
            "Central",
            "Content1",
            waypoint_protocol::AccountId::new_v4(),
            "nobody",
            CharacterId::NONE,
            None,
        );
        f.store.persist_ticket(&ticket).await.unwrap();
        assert!(matches!(
            f.authority.validate_ticket("nobody", "Content1").await,
            Err(TicketRejection::AccountLoad(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_ticket_store_offline_is_store_rejection() {
        let f = fixture("Content1");
        f.store.set_offline(true);
        assert!(matches!(
            f.authority.validate_ticket("alice", "Content1").await,
            Err(TicketRejection::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_validate_ticket_assisted_skips_durable_checks() {
        let f = fixture("Content1");
        let (account, character) = seed(&f.store, "alice").await;
        // Expired and aimed elsewhere: only the live record is consulted.
        let ticket = AuthorizationTicket::issue("Central", "Content1", account.id, "alice", character.id, Some(GameId(2)))
            .at(Utc::now() - chrono::Duration::days(1));
        f.sessions
            .authorize(SessionRecord::new(&account, ticket), false)
            .await;

        let ctx = f.authority.validate_ticket("alice", "Elsewhere").await.unwrap();
        assert!(ctx.assisted);
        assert_eq!(ctx.ticket.target_game, Some(GameId(2)));
        assert_eq!(ctx.character.unwrap().id, character.id);
    }

    #[tokio::test]
    async fn test_validate_ticket_assisted_keeps_ticket_for_other_server() {
        let f = fixture("Central");
        let (account, character) = seed(&f.store, "alice").await;
        let login = AuthorizationTicket::issue("Login", "Central", account.id, "alice", character.id, None);
        f.sessions
            .authorize(SessionRecord::new(&account, login), false)
            .await;
        let onward = f
            .authority
            .issue_ticket("Content1", &account, character.id, Some(GameId(3)), false)
            .await
            .unwrap();

        let ctx = f.authority.validate_ticket("alice", "Central").await.unwrap();
        assert!(ctx.assisted);
        assert_eq!(
            f.store.load_ticket_for_account("alice").await.unwrap(),
            Some(onward)
        );
    }

    #[tokio::test]
    async fn test_validate_ticket_assisted_consumes_own_ticket() {
        let f = fixture("Content1");
        let (account, character) = seed(&f.store, "alice").await;
        let ticket = AuthorizationTicket::issue("Central", "content1", account.id, "alice", character.id, Some(GameId(3)));
        f.store.persist_ticket(&ticket).await.unwrap();
        f.sessions
            .authorize(SessionRecord::new(&account, ticket), false)
            .await;

        let ctx = f.authority.validate_ticket("alice", "Content1").await.unwrap();
        assert!(ctx.assisted);
        assert_eq!(f.store.load_ticket_for_account("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_issue_ticket_persists_from_own_server() {
        let f = fixture("Central");
        let (account, character) = seed(&f.store, "alice").await;
        let ticket = f
            .authority
            .issue_ticket("Content1", &account, character.id, Some(GameId(1)), false)
            .await
            .unwrap();
        assert_eq!(ticket.authorizing_server, "Central");
        let stored = f.store.load_ticket_for_character(character.id).await.unwrap();
        assert_eq!(stored, Some(ticket));
    }
}
