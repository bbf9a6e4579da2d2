//! The Game entity: one lobby/match and its membership state machine.
//!
//! ```text
//! Lobby ──(start requested, every player at 100% load)──→ Started
//!   │                                                       │
//!   └──────────────(conclude / abandon + purge)─────────────┘──→ ended
//! ```
//!
//! `ended` is a flag beside the state slot, not a third state: a game can
//! be abandoned from either slot.
//!
//! # Locking
//!
//! Players and observers each sit behind their own lock and each roster
//! keeps its ordered "all" list in the same critical section as its map.
//! The state slot has its own lock. No method holds two of these at once;
//! events are published after every lock is released.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info};
use waypoint_protocol::{
    CharacterId, CharacterInfo, GameDescriptor, GameId, GameListEntry, GameOptions, GameSnapshot,
    GameState, LOAD_PERCENT, Properties, PropertyValue,
};
use waypoint_session::{SubscriptionId, Subscribers};

use crate::{GameConfig, GameError, GameEvent, MessageLog};

/// Whether an admission concerns the viewing character or someone else.
///
/// A requester seeing its own admission resolves its pending join; any
/// other admission is a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concerns {
    Requester,
    Other,
}

/// Result of [`Game::admit_player`].
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub character: CharacterInfo,
    pub as_observer: bool,
    pub concerns: Concerns,
}

#[derive(Debug, Default)]
struct Roster {
    members: HashMap<CharacterId, CharacterInfo>,
    /// Admission order; always holds exactly the values of `members`.
    all: Vec<CharacterInfo>,
}

impl Roster {
    fn from_list(list: Vec<CharacterInfo>) -> Self {
        let mut roster = Self::default();
        for c in list {
            roster.insert(c);
        }
        roster
    }

    fn insert(&mut self, info: CharacterInfo) -> bool {
        if self.members.contains_key(&info.id) {
            return false;
        }
        self.members.insert(info.id, info.clone());
        self.all.push(info);
        true
    }

    fn remove(&mut self, id: CharacterId) -> Option<CharacterInfo> {
        let removed = self.members.remove(&id)?;
        self.all.retain(|c| c.id != id);
        Some(removed)
    }

    fn update(&mut self, info: &CharacterInfo) {
        if let Some(slot) = self.members.get_mut(&info.id) {
            *slot = info.clone();
        }
        if let Some(slot) = self.all.iter_mut().find(|c| c.id == info.id) {
            *slot = info.clone();
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    solved: bool,
    ended: bool,
    shutting_down: bool,
    start_requested: bool,
    abandoned_at: Option<DateTime<Utc>>,
}

pub struct Game {
    id: GameId,
    options: GameOptions,
    owner: RwLock<CharacterId>,
    state: RwLock<GameState>,
    players: RwLock<Roster>,
    observers: RwLock<Roster>,
    ever_active: RwLock<HashMap<CharacterId, CharacterInfo>>,
    flags: Mutex<Flags>,
    properties: RwLock<Properties>,
    messages: Mutex<MessageLog>,
    events: Subscribers<GameEvent>,
}

impl Game {
    /// A fresh lobby owned by the system.
    pub fn new(id: GameId, options: GameOptions, config: &GameConfig) -> Self {
        let properties = options.properties.clone();
        Self {
            id,
            options,
            owner: RwLock::new(CharacterId::NONE),
            state: RwLock::new(GameState::Lobby),
            players: RwLock::new(Roster::default()),
            observers: RwLock::new(Roster::default()),
            ever_active: RwLock::new(HashMap::new()),
            flags: Mutex::new(Flags::default()),
            properties: RwLock::new(properties),
            messages: Mutex::new(MessageLog::new(config.message_log_capacity)),
            events: Subscribers::new(),
        }
    }

    pub fn from_descriptor(descriptor: &GameDescriptor, config: &GameConfig) -> Self {
        Self::new(descriptor.game_id, descriptor.options.clone(), config)
    }

    /// Rebuilds a game from a wire snapshot (a client's local mirror).
    pub fn from_snapshot(snapshot: GameSnapshot, config: &GameConfig) -> Self {
        let started = snapshot.state == GameState::Started;
        let ever_active = if started {
            snapshot
                .players
                .iter()
                .map(|c| (c.id, c.clone()))
                .collect()
        } else {
            HashMap::new()
        };
        Self {
            id: snapshot.game_id,
            options: snapshot.options,
            owner: RwLock::new(snapshot.owner),
            state: RwLock::new(snapshot.state),
            players: RwLock::new(Roster::from_list(snapshot.players)),
            observers: RwLock::new(Roster::from_list(snapshot.observers)),
            ever_active: RwLock::new(ever_active),
            flags: Mutex::new(Flags {
                solved: snapshot.solved,
                ended: snapshot.ended,
                abandoned_at: snapshot.abandoned_at,
                ..Flags::default()
            }),
            properties: RwLock::new(snapshot.properties),
            messages: Mutex::new(MessageLog::from_lines(
                config.message_log_capacity,
                snapshot.messages,
            )),
            events: Subscribers::new(),
        }
    }

    pub fn id(&self) -> GameId {
        self.id
    }

    pub fn options(&self) -> &GameOptions {
        &self.options
    }

    // -- events ---------------------------------------------------------

    pub async fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<GameEvent>) {
        self.events.subscribe().await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id).await
    }

    async fn publish(&self, event: GameEvent) {
        self.events.publish(event).await;
    }

    // -- ownership and state --------------------------------------------

    pub async fn owner(&self) -> CharacterId {
        *self.owner.read().await
    }

    pub async fn set_owner(&self, owner: CharacterId) {
        *self.owner.write().await = owner;
        debug!(game_id = %self.id, %owner, "game owner set");
        self.publish(GameEvent::OwnerChanged {
            game_id: self.id,
            owner,
        })
        .await;
    }

    /// Sets `owner` only if the game is still owned by the system.
    /// Returns `true` if it did.
    pub async fn claim_ownership(&self, owner: CharacterId) -> bool {
        {
            let mut current = self.owner.write().await;
            if current.is_some() {
                return false;
            }
            *current = owner;
        }
        info!(game_id = %self.id, %owner, "game claimed by first admission");
        self.publish(GameEvent::OwnerChanged {
            game_id: self.id,
            owner,
        })
        .await;
        true
    }

    pub async fn state(&self) -> GameState {
        *self.state.read().await
    }

    pub async fn is_started(&self) -> bool {
        self.state().await == GameState::Started
    }

    pub async fn is_ended(&self) -> bool {
        self.flags.lock().await.ended
    }

    pub async fn is_solved(&self) -> bool {
        self.flags.lock().await.solved
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.flags.lock().await.shutting_down
    }

    pub async fn set_shutting_down(&self) {
        self.flags.lock().await.shutting_down = true;
    }

    pub async fn abandoned_at(&self) -> Option<DateTime<Utc>> {
        self.flags.lock().await.abandoned_at
    }

    // -- membership -----------------------------------------------------

    /// Admits `info` as a player or observer.
    ///
    /// `viewer` is the character on whose behalf the caller is acting; the
    /// result says whether this admission concerns it.
    ///
    /// # Errors
    /// [`GameError::Ended`], [`GameError::Full`],
    /// [`GameError::ObserversNotAllowed`], [`GameError::ObserversFull`] or
    /// [`GameError::AlreadyMember`].
    pub async fn admit_player(
        &self,
        info: CharacterInfo,
        as_observer: bool,
        viewer: Option<CharacterId>,
    ) -> Result<Admission, GameError> {
        if self.flags.lock().await.ended {
            return Err(GameError::Ended(self.id));
        }
        let character = info.id;

        if as_observer {
            if !self.options.allow_observers {
                return Err(GameError::ObserversNotAllowed(self.id));
            }
            let mut observers = self.observers.write().await;
            let max = self.options.max_observers;
            if max > 0 && observers.all.len() >= max {
                return Err(GameError::ObserversFull { game_id: self.id, max });
            }
            if !observers.insert(info.clone()) {
                return Err(GameError::AlreadyMember { game_id: self.id, character });
            }
        } else {
            let mut players = self.players.write().await;
            let max = self.options.max_players;
            if players.members.contains_key(&character) {
                return Err(GameError::AlreadyMember { game_id: self.id, character });
            }
            if players.all.len() >= max {
                return Err(GameError::Full { game_id: self.id, max });
            }
            players.insert(info.clone());
        }

        if !as_observer {
            // Read after inserting: a concurrent start() either snapshotted
            // this player or is visible here.
            if self.is_started().await {
                self.ever_active.write().await.insert(character, info.clone());
            }
            self.clear_abandoned().await;
        }

        let concerns = if viewer == Some(character) {
            Concerns::Requester
        } else {
            Concerns::Other
        };
        debug!(game_id = %self.id, %character, as_observer, ?concerns, "admitted");

        self.publish(if as_observer {
            GameEvent::ObserverJoined {
                game_id: self.id,
                observer: info.clone(),
            }
        } else {
            GameEvent::PlayerJoined {
                game_id: self.id,
                player: info.clone(),
            }
        })
        .await;

        Ok(Admission {
            character: info,
            as_observer,
            concerns,
        })
    }

    pub async fn remove_player(&self, id: CharacterId) -> Option<CharacterInfo> {
        self.remove_player_at(id, Utc::now()).await
    }

    /// Removes a player. `ever_active_players` is left untouched. If this
    /// empties an unsolved game it is marked abandoned as of `now`.
    pub async fn remove_player_at(&self, id: CharacterId, now: DateTime<Utc>) -> Option<CharacterInfo> {
        let (removed, now_empty) = {
            let mut players = self.players.write().await;
            let removed = players.remove(id)?;
            (removed, players.all.is_empty())
        };
        debug!(game_id = %self.id, character = %id, "player removed");
        self.publish(GameEvent::PlayerLeft {
            game_id: self.id,
            character_id: id,
        })
        .await;

        if now_empty && !self.is_solved().await {
            self.mark_abandoned_at(now).await;
        }
        Some(removed)
    }

    pub async fn remove_observer(&self, id: CharacterId) -> Option<CharacterInfo> {
        let removed = self.observers.write().await.remove(id)?;
        self.publish(GameEvent::ObserverRemoved {
            game_id: self.id,
            character_id: id,
        })
        .await;
        Some(removed)
    }

    /// Removes `id` from whichever roster holds it. Returns the info and
    /// whether it was an observer.
    pub async fn remove_member(&self, id: CharacterId) -> Option<(CharacterInfo, bool)> {
        if let Some(c) = self.remove_player(id).await {
            return Some((c, false));
        }
        self.remove_observer(id).await.map(|c| (c, true))
    }

    /// `Some(true)` for an observer, `Some(false)` for a player.
    pub async fn membership(&self, id: CharacterId) -> Option<bool> {
        if self.players.read().await.members.contains_key(&id) {
            return Some(false);
        }
        if self.observers.read().await.members.contains_key(&id) {
            return Some(true);
        }
        None
    }

    pub async fn players(&self) -> Vec<CharacterInfo> {
        self.players.read().await.all.clone()
    }

    pub async fn observers(&self) -> Vec<CharacterInfo> {
        self.observers.read().await.all.clone()
    }

    pub async fn player(&self, id: CharacterId) -> Option<CharacterInfo> {
        self.players.read().await.members.get(&id).cloned()
    }

    pub async fn ever_active_players(&self) -> Vec<CharacterInfo> {
        let mut all: Vec<_> = self.ever_active.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub async fn player_count(&self) -> usize {
        self.players.read().await.all.len()
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.all.len()
    }

    /// Every member's character id, players first.
    pub async fn member_ids(&self) -> Vec<CharacterId> {
        let mut ids: Vec<_> = self.players.read().await.all.iter().map(|c| c.id).collect();
        ids.extend(self.observers.read().await.all.iter().map(|c| c.id));
        ids
    }

    /// Sets a property on a player's character info.
    pub async fn set_player_property(
        &self,
        id: CharacterId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), GameError> {
        let mut players = self.players.write().await;
        let Some(mut info) = players.members.get(&id).cloned() else {
            return Err(GameError::NotMember {
                game_id: self.id,
                character: id,
            });
        };
        info.properties.insert(key.to_string(), value);
        players.update(&info);
        Ok(())
    }

    /// `true` when every current player reports at least 100 % load.
    pub async fn all_players_loaded(&self) -> bool {
        self.players
            .read()
            .await
            .all
            .iter()
            .all(|c| c.load_percent() >= 100.0)
    }

    /// Records a player's loading progress.
    pub async fn report_load(&self, id: CharacterId, percent: f64) -> Result<(), GameError> {
        self.set_player_property(id, LOAD_PERCENT, PropertyValue::Float(percent.clamp(0.0, 100.0)))
            .await
    }

    // -- lifecycle --------------------------------------------------------

    /// The owner asks to start. The game moves to Started once every player
    /// has loaded (see [`Game::start_if_loaded`]).
    pub async fn request_start(&self, requester: CharacterId) -> Result<(), GameError> {
        if self.owner().await != requester {
            return Err(GameError::NotOwner {
                game_id: self.id,
                character: requester,
            });
        }
        if self.is_started().await {
            return Err(GameError::AlreadyStarted(self.id));
        }
        let have = self.player_count().await;
        let need = self.options.min_players;
        if have < need {
            return Err(GameError::NotEnoughPlayers {
                game_id: self.id,
                have,
                need,
            });
        }
        let mut flags = self.flags.lock().await;
        if flags.ended {
            return Err(GameError::Ended(self.id));
        }
        flags.start_requested = true;
        Ok(())
    }

    pub async fn start_requested(&self) -> bool {
        self.flags.lock().await.start_requested
    }

    /// Starts the game if a start was requested and everyone has loaded.
    /// Returns `true` if this call performed the transition.
    pub async fn start_if_loaded(&self) -> bool {
        if !self.start_requested().await || !self.all_players_loaded().await {
            return false;
        }
        self.start().await.is_ok()
    }

    /// Lobby → Started. Snapshots the current players into
    /// `ever_active_players`.
    pub async fn start(&self) -> Result<(), GameError> {
        if self.is_ended().await {
            return Err(GameError::Ended(self.id));
        }
        {
            let mut state = self.state.write().await;
            if *state == GameState::Started {
                return Err(GameError::AlreadyStarted(self.id));
            }
            *state = GameState::Started;
        }
        let players = self.players().await;
        {
            let mut ever = self.ever_active.write().await;
            for c in players {
                ever.insert(c.id, c);
            }
        }
        info!(game_id = %self.id, "game started");
        self.publish(GameEvent::Started { game_id: self.id }).await;
        Ok(())
    }

    /// Ends the game. Returns `false` if it had already ended.
    pub async fn conclude(&self, solved: bool) -> bool {
        {
            let mut flags = self.flags.lock().await;
            if flags.ended {
                return false;
            }
            flags.ended = true;
            flags.solved = solved;
        }
        info!(game_id = %self.id, solved, "game ended");
        self.publish(GameEvent::Ended {
            game_id: self.id,
            solved,
        })
        .await;
        true
    }

    pub async fn mark_abandoned(&self) {
        self.mark_abandoned_at(Utc::now()).await
    }

    pub async fn mark_abandoned_at(&self, now: DateTime<Utc>) {
        {
            let mut flags = self.flags.lock().await;
            if flags.abandoned_at.is_some() {
                return;
            }
            flags.abandoned_at = Some(now);
        }
        info!(game_id = %self.id, "game abandoned");
        self.publish(GameEvent::Abandoned { game_id: self.id }).await;
    }

    pub async fn clear_abandoned(&self) {
        self.flags.lock().await.abandoned_at = None;
    }

    // -- properties and messages -----------------------------------------

    pub async fn properties(&self) -> Properties {
        self.properties.read().await.clone()
    }

    pub async fn set_property(&self, key: &str, value: PropertyValue) {
        self.properties.write().await.insert(key.to_string(), value);
    }

    pub async fn post_message(&self, line: impl Into<String>) {
        let line = line.into();
        self.messages.lock().await.push(line.clone());
        self.publish(GameEvent::Message {
            game_id: self.id,
            line,
        })
        .await;
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub async fn message_display(&self) -> String {
        self.messages.lock().await.display().to_string()
    }

    // -- snapshots --------------------------------------------------------

    pub async fn snapshot(&self) -> GameSnapshot {
        let (solved, ended, abandoned_at) = {
            let f = self.flags.lock().await;
            (f.solved, f.ended, f.abandoned_at)
        };
        GameSnapshot {
            game_id: self.id,
            owner: self.owner().await,
            options: self.options.clone(),
            state: self.state().await,
            solved,
            ended,
            players: self.players().await,
            observers: self.observers().await,
            properties: self.properties().await,
            messages: self.messages().await,
            abandoned_at,
        }
    }

    pub async fn list_entry(&self, server: &str) -> GameListEntry {
        GameListEntry {
            game_id: self.id,
            name: self.options.name.clone(),
            target_server: server.to_string(),
            state: self.state().await,
            player_count: self.player_count().await,
            max_players: self.options.max_players,
            observer_count: self.observer_count().await,
            ended: self.is_ended().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use waypoint_protocol::AccountId;

    use super::*;

    fn game(max_players: usize) -> Game {
        Game::new(
            GameId(1),
            GameOptions::with_max_players(max_players),
            &GameConfig::default(),
        )
    }

    fn character(id: i32) -> CharacterInfo {
        CharacterInfo::new(CharacterId(id), AccountId::new_v4(), format!("c{id}"))
    }

    #[tokio::test]
    async fn test_admit_player_concerns_requester_only_for_viewer() {
        let g = game(4);
        let own = g
            .admit_player(character(1), false, Some(CharacterId(1)))
            .await
            .unwrap();
        assert_eq!(own.concerns, Concerns::Requester);
        let other = g
            .admit_player(character(2), false, Some(CharacterId(1)))
            .await
            .unwrap();
        assert_eq!(other.concerns, Concerns::Other);
        assert_eq!(g.player_count().await, 2);
    }

    #[tokio::test]
    async fn test_admit_player_full_game_rejected() {
        let g = game(1);
        g.admit_player(character(1), false, None).await.unwrap();
        assert_eq!(
            g.admit_player(character(2), false, None).await,
            Err(GameError::Full {
                game_id: GameId(1),
                max: 1
            })
        );
    }

    #[tokio::test]
    async fn test_admit_player_duplicate_rejected() {
        let g = game(4);
        g.admit_player(character(1), false, None).await.unwrap();
        assert!(matches!(
            g.admit_player(character(1), false, None).await,
            Err(GameError::AlreadyMember { .. })
        ));
    }

    #[tokio::test]
    async fn test_admit_observer_respects_options() {
        let mut opts = GameOptions::with_max_players(2);
        opts.max_observers = 1;
        let g = Game::new(GameId(2), opts, &GameConfig::default());
        g.admit_player(character(1), true, None).await.unwrap();
        assert!(matches!(
            g.admit_player(character(2), true, None).await,
            Err(GameError::ObserversFull { max: 1, .. })
        ));
        assert_eq!(g.observer_count().await, 1);
        assert_eq!(g.player_count().await, 0);

        let mut closed = GameOptions::with_max_players(2);
        closed.allow_observers = false;
        let g = Game::new(GameId(3), closed, &GameConfig::default());
        assert_eq!(
            g.admit_player(character(1), true, None).await,
            Err(GameError::ObserversNotAllowed(GameId(3)))
        );
    }

    #[tokio::test]
    async fn test_admit_while_started_records_ever_active() {
        let g = game(4);
        g.admit_player(character(1), false, None).await.unwrap();
        g.start().await.unwrap();
        g.admit_player(character(2), false, None).await.unwrap();
        g.remove_player(CharacterId(2)).await;

        let ever: Vec<_> = g.ever_active_players().await.iter().map(|c| c.id).collect();
        assert_eq!(ever, vec![CharacterId(1), CharacterId(2)]);
        assert_eq!(g.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_last_player_marks_abandoned_and_join_clears() {
        let g = game(4);
        g.admit_player(character(1), false, None).await.unwrap();
        g.start().await.unwrap();
        assert!(g.abandoned_at().await.is_none());

        g.remove_player(CharacterId(1)).await.unwrap();
        assert!(g.abandoned_at().await.is_some());

        g.admit_player(character(2), false, None).await.unwrap();
        assert!(g.abandoned_at().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_last_player_of_solved_game_not_abandoned() {
        let g = game(4);
        g.admit_player(character(1), false, None).await.unwrap();
        g.conclude(true).await;
        g.remove_player(CharacterId(1)).await;
        assert!(g.abandoned_at().await.is_none());
    }

    #[tokio::test]
    async fn test_all_players_loaded_requires_every_player() {
        let g = game(4);
        g.admit_player(character(1), false, None).await.unwrap();
        g.admit_player(character(2), false, None).await.unwrap();
        g.report_load(CharacterId(1), 100.0).await.unwrap();
        assert!(!g.all_players_loaded().await);
        g.report_load(CharacterId(2), 150.0).await.unwrap();
        assert!(g.all_players_loaded().await);
    }

    #[tokio::test]
    async fn test_request_start_checks_owner_and_minimum() {
        let mut opts = GameOptions::with_max_players(4);
        opts.min_players = 2;
        let g = Game::new(GameId(5), opts, &GameConfig::default());
        assert!(g.claim_ownership(CharacterId(1)).await);
        assert!(!g.claim_ownership(CharacterId(2)).await);
        g.admit_player(character(1), false, None).await.unwrap();

        assert!(matches!(
            g.request_start(CharacterId(2)).await,
            Err(GameError::NotOwner { .. })
        ));
        assert!(matches!(
            g.request_start(CharacterId(1)).await,
            Err(GameError::NotEnoughPlayers { have: 1, need: 2, .. })
        ));

        g.admit_player(character(2), false, None).await.unwrap();
        g.request_start(CharacterId(1)).await.unwrap();
        assert!(!g.start_if_loaded().await);
        g.report_load(CharacterId(1), 100.0).await.unwrap();
        g.report_load(CharacterId(2), 100.0).await.unwrap();
        assert!(g.start_if_loaded().await);
        assert_eq!(g.state().await, GameState::Started);
        assert!(!g.start_if_loaded().await);
    }

    #[tokio::test]
    async fn test_conclude_only_once_and_blocks_admission() {
        let g = game(4);
        let (_id, mut events) = g.subscribe().await;
        assert!(g.conclude(false).await);
        assert!(!g.conclude(true).await);
        assert!(!g.is_solved().await);
        assert_eq!(
            events.recv().await,
            Some(GameEvent::Ended {
                game_id: GameId(1),
                solved: false
            })
        );
        assert_eq!(
            g.admit_player(character(1), false, None).await,
            Err(GameError::Ended(GameId(1)))
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trips_through_mirror() {
        let g = game(4);
        g.claim_ownership(CharacterId(1)).await;
        g.admit_player(character(1), false, None).await.unwrap();
        g.admit_player(character(9), true, None).await.unwrap();
        g.post_message("c1: hello").await;

        let mirror = Game::from_snapshot(g.snapshot().await, &GameConfig::default());
        assert_eq!(mirror.owner().await, CharacterId(1));
        assert_eq!(mirror.player_count().await, 1);
        assert_eq!(mirror.membership(CharacterId(9)).await, Some(true));
        assert_eq!(mirror.message_display().await, "c1: hello");
    }
}
