//! Identity newtypes shared by every node.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit account identifier issued by the Login authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Generates a fresh random account id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A-{}", self.0)
    }
}

/// Character (player) identifier. `-1` means "no character" and, as a game
/// owner, "the system".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub i32);

impl CharacterId {
    /// The sentinel for "no character" / system ownership.
    pub const NONE: CharacterId = CharacterId(-1);

    /// Returns `true` unless this is the `-1` sentinel.
    pub fn is_some(self) -> bool {
        self != Self::NONE
    }
}

impl Default for CharacterId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// Cluster-unique game identifier, allocated by Central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub u64);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G-{}", self.0)
    }
}
