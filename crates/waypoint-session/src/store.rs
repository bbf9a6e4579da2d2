//! The durable-store contract and an in-memory implementation.
//!
//! The session layer never owns a database. It calls [`DurableStore`] for
//! tickets, accounts, characters and game descriptors, always outside its
//! own locks, and treats every error as a transient collaborator failure:
//! logged, reported as a negative result, never fatal to the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use waypoint_protocol::{
    AccountId, AuthorizationTicket, CharacterId, CharacterInfo, GameDescriptor, GameId,
};

use crate::StoreError;

/// A durable account profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    /// Administrators are exempt from time-based session eviction.
    pub is_admin: bool,
}

/// Persistence operations the session and game flows depend on.
///
/// Account names are case-insensitive. Implementations commit each call
/// atomically; a failed call leaves no partial write behind.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn load_ticket_for_account(
        &self,
        account_name: &str,
    ) -> Result<Option<AuthorizationTicket>, StoreError>;

    async fn load_ticket_for_character(
        &self,
        character_id: CharacterId,
    ) -> Result<Option<AuthorizationTicket>, StoreError>;

    /// Stores `ticket`, superseding any earlier ticket for the account.
    async fn persist_ticket(&self, ticket: &AuthorizationTicket) -> Result<(), StoreError>;

    /// Removes and returns the account's ticket.
    async fn consume_ticket(
        &self,
        account_name: &str,
    ) -> Result<Option<AuthorizationTicket>, StoreError>;

    /// Clears the durable session so a stale ticket can no longer be used.
    async fn unauthorize_session(&self, account_name: &str) -> Result<(), StoreError>;

    async fn load_account(&self, account_name: &str) -> Result<Account, StoreError>;

    async fn load_character(&self, character_id: CharacterId) -> Result<CharacterInfo, StoreError>;

    async fn save_character(&self, character: &CharacterInfo) -> Result<(), StoreError>;

    async fn create_character(
        &self,
        account_id: AccountId,
        name: &str,
    ) -> Result<CharacterInfo, StoreError>;

    async fn delete_character(&self, character_id: CharacterId) -> Result<(), StoreError>;

    async fn persist_game_descriptor(&self, descriptor: &GameDescriptor) -> Result<(), StoreError>;

    async fn load_game_descriptor(
        &self,
        game_id: GameId,
    ) -> Result<Option<GameDescriptor>, StoreError>;
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    characters: HashMap<CharacterId, CharacterInfo>,
    tickets: HashMap<String, AuthorizationTicket>,
    descriptors: HashMap<GameId, GameDescriptor>,
    next_character: i32,
}

/// A [`DurableStore`] held in process memory.
///
/// Shared by every node of an in-process cluster, it plays the database
/// that lets a Content server validate a ticket Central issued without a
/// live link between them. [`MemoryStore::set_offline`] makes every call
/// fail with [`StoreError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

fn key(account_name: &str) -> String {
    account_name.to_lowercase()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) an account profile.
    pub async fn register_account(&self, name: &str, is_admin: bool) -> Account {
        let account = Account {
            id: AccountId::new_v4(),
            name: name.to_string(),
            is_admin,
        };
        self.tables
            .lock()
            .await
            .accounts
            .insert(key(name), account.clone());
        account
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_ticket_for_account(
        &self,
        account_name: &str,
    ) -> Result<Option<AuthorizationTicket>, StoreError> {
        self.check_online()?;
        Ok(self.tables.lock().await.tickets.get(&key(account_name)).cloned())
    }

    async fn load_ticket_for_character(
        &self,
        character_id: CharacterId,
    ) -> Result<Option<AuthorizationTicket>, StoreError> {
        self.check_online()?;
        if !character_id.is_some() {
            return Ok(None);
        }
        let tables = self.tables.lock().await;
        Ok(tables
            .tickets
            .values()
            .find(|t| t.character_id == character_id)
            .cloned())
    }

    async fn persist_ticket(&self, ticket: &AuthorizationTicket) -> Result<(), StoreError> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .tickets
            .insert(key(&ticket.account_name), ticket.clone());
        Ok(())
    }

    async fn consume_ticket(
        &self,
        account_name: &str,
    ) -> Result<Option<AuthorizationTicket>, StoreError> {
        self.check_online()?;
        Ok(self.tables.lock().await.tickets.remove(&key(account_name)))
    }

    async fn unauthorize_session(&self, account_name: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.tables.lock().await.tickets.remove(&key(account_name));
        Ok(())
    }

    async fn load_account(&self, account_name: &str) -> Result<Account, StoreError> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .accounts
            .get(&key(account_name))
            .cloned()
            .ok_or_else(|| StoreError::not_found("account", account_name))
    }

    async fn load_character(&self, character_id: CharacterId) -> Result<CharacterInfo, StoreError> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .characters
            .get(&character_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("character", character_id))
    }

    async fn save_character(&self, character: &CharacterInfo) -> Result<(), StoreError> {
        self.check_online()?;
        let mut tables = self.tables.lock().await;
        match tables.characters.get_mut(&character.id) {
            Some(existing) => {
                *existing = character.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("character", character.id)),
        }
    }

    async fn create_character(
        &self,
        account_id: AccountId,
        name: &str,
    ) -> Result<CharacterInfo, StoreError> {
        self.check_online()?;
        let mut tables = self.tables.lock().await;
        if tables.characters.values().any(|c| c.name == name) {
            return Err(StoreError::Conflict(format!("character name '{name}' is taken")));
        }
        let id = CharacterId(tables.next_character);
        tables.next_character += 1;
        let character = CharacterInfo::new(id, account_id, name);
        tables.characters.insert(id, character.clone());
        Ok(character)
    }

    async fn delete_character(&self, character_id: CharacterId) -> Result<(), StoreError> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .characters
            .remove(&character_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("character", character_id))
    }

    async fn persist_game_descriptor(&self, descriptor: &GameDescriptor) -> Result<(), StoreError> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .descriptors
            .insert(descriptor.game_id, descriptor.clone());
        Ok(())
    }

    async fn load_game_descriptor(
        &self,
        game_id: GameId,
    ) -> Result<Option<GameDescriptor>, StoreError> {
        self.check_online()?;
        Ok(self.tables.lock().await.descriptors.get(&game_id).cloned())
    }
}
