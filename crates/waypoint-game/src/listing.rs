//! Cluster-wide game listing kept by Central.
//!
//! Central does not host games. It keeps the provisional descriptor it
//! issued for each game plus the latest listing row its Content server
//! reported, and picks quick-match targets from those rows. A row no
//! Content server ever reported on is dropped once it outlives the
//! ticket that would have brought its creator there.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use waypoint_protocol::{GameDescriptor, GameId, GameListEntry, GameState};

/// One game as Central sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedGame {
    pub descriptor: GameDescriptor,
    pub entry: GameListEntry,
    /// When Central approved the game.
    pub listed_at: DateTime<Utc>,
    /// Set by the first status row from the hosting server.
    pub confirmed: bool,
}

impl ListedGame {
    /// A row for a game Central just approved; nobody has joined yet.
    pub fn provisional(descriptor: GameDescriptor) -> Self {
        Self::provisional_at(descriptor, Utc::now())
    }

    pub fn provisional_at(descriptor: GameDescriptor, listed_at: DateTime<Utc>) -> Self {
        let entry = GameListEntry {
            game_id: descriptor.game_id,
            name: descriptor.options.name.clone(),
            target_server: descriptor.target_server.clone(),
            state: GameState::Lobby,
            player_count: 0,
            max_players: descriptor.options.max_players,
            observer_count: 0,
            ended: false,
        };
        Self {
            descriptor,
            entry,
            listed_at,
            confirmed: false,
        }
    }
}

#[derive(Default)]
pub struct GameListing {
    games: RwLock<BTreeMap<GameId, ListedGame>>,
}

impl GameListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, game: ListedGame) {
        self.games.write().await.insert(game.descriptor.game_id, game);
    }

    /// Applies a status row from a Content server. Returns `false` for a
    /// game Central never approved.
    pub async fn update(&self, entry: GameListEntry) -> bool {
        match self.games.write().await.get_mut(&entry.game_id) {
            Some(listed) => {
                listed.entry = entry;
                listed.confirmed = true;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: GameId) -> Option<ListedGame> {
        self.games.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: GameId) -> Option<ListedGame> {
        self.games.write().await.remove(&id)
    }

    /// Drops every game hosted on `server`. Returns the removed ids.
    pub async fn remove_hosted_on(&self, server: &str) -> Vec<GameId> {
        let mut games = self.games.write().await;
        let ids: Vec<GameId> = games
            .values()
            .filter(|g| g.descriptor.target_server.eq_ignore_ascii_case(server))
            .map(|g| g.descriptor.game_id)
            .collect();
        for id in &ids {
            games.remove(id);
        }
        ids
    }

    /// Removes unconfirmed games listed more than `ttl` before `now`.
    pub async fn expire_provisional_at(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<ListedGame> {
        let mut games = self.games.write().await;
        let stale: Vec<GameId> = games
            .values()
            .filter(|g| {
                !g.confirmed
                    && g.listed_at
                        .checked_add_signed(ttl)
                        .is_some_and(|deadline| deadline < now)
            })
            .map(|g| g.descriptor.game_id)
            .collect();
        stale.iter().filter_map(|id| games.remove(id)).collect()
    }

    /// Listing rows ordered by id.
    pub async fn entries(&self) -> Vec<GameListEntry> {
        self.games
            .read()
            .await
            .values()
            .map(|g| g.entry.clone())
            .collect()
    }

    /// Number of listed games per hosting server.
    pub async fn count_hosted_on(&self, server: &str) -> usize {
        self.games
            .read()
            .await
            .values()
            .filter(|g| g.descriptor.target_server.eq_ignore_ascii_case(server) && !g.entry.ended)
            .count()
    }

    /// Lowest-id joinable game.
    pub async fn quick_match(&self) -> Option<ListedGame> {
        self.games
            .read()
            .await
            .values()
            .find(|g| g.entry.is_joinable())
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use waypoint_protocol::{CharacterId, GameOptions};

    use super::*;

    fn listed(id: u64, server: &str, max: usize) -> ListedGame {
        ListedGame::provisional(GameDescriptor {
            game_id: GameId(id),
            target_server: server.into(),
            options: GameOptions::with_max_players(max),
            owner: CharacterId(1),
        })
    }

    #[tokio::test]
    async fn test_quick_match_picks_lowest_joinable() {
        let listing = GameListing::new();
        listing.insert(listed(2, "Content1", 4)).await;
        listing.insert(listed(1, "Content1", 1)).await;

        let mut full = listing.get(GameId(1)).await.unwrap().entry;
        full.player_count = 1;
        assert!(listing.update(full).await);

        assert_eq!(listing.quick_match().await.unwrap().descriptor.game_id, GameId(2));
    }

    #[tokio::test]
    async fn test_update_unknown_game_ignored() {
        let listing = GameListing::new();
        let row = listed(9, "Content1", 4).entry;
        assert!(!listing.update(row).await);
        assert!(listing.is_empty().await);
    }

    #[tokio::test]
    async fn test_expire_provisional_at_drops_only_stale_unconfirmed() {
        let listing = GameListing::new();
        let t0 = Utc::now();
        let ttl = Duration::seconds(300);
        let make = |id: u64| ListedGame::provisional_at(listed(id, "Content1", 4).descriptor, t0);
        listing.insert(make(1)).await;
        listing.insert(make(2)).await;
        let mut row = listing.get(GameId(2)).await.unwrap().entry;
        row.player_count = 1;
        assert!(listing.update(row).await);

        assert!(listing.expire_provisional_at(t0 + ttl, ttl).await.is_empty());
        let expired = listing
            .expire_provisional_at(t0 + ttl + Duration::seconds(1), ttl)
            .await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].descriptor.game_id, GameId(1));
        assert!(listing.get(GameId(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_hosted_on_drops_only_that_server() {
        let listing = GameListing::new();
        listing.insert(listed(1, "Content1", 4)).await;
        listing.insert(listed(2, "Content2", 4)).await;
        listing.insert(listed(3, "Content1", 4)).await;

        assert_eq!(listing.remove_hosted_on("Content1").await, vec![GameId(1), GameId(3)]);
        assert_eq!(listing.len().await, 1);
        assert_eq!(listing.count_hosted_on("Content2").await, 1);
    }

    #[tokio::test]
    async fn test_server_names_match_ignoring_case() {
        let listing = GameListing::new();
        listing.insert(listed(1, "Content1", 4)).await;

        assert_eq!(listing.count_hosted_on("CONTENT1").await, 1);
        assert_eq!(listing.remove_hosted_on("content1").await, vec![GameId(1)]);
    }
}
