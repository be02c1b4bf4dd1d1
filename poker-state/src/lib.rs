// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Versioned load/save of the opaque game-state document. Grounded on
//! `betting_handler.py::_load_state_with_version` and
//! `GameEngine.save_game_state_with_version` - the orchestrator never
//! inspects the document beyond the small contract in `poker_core::GameState`.

mod error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use error::StateStoreError;

use poker_core::{ChatId, GameState};
use poker_kv::KvStore;

fn state_key(chat_id: ChatId) -> String {
    format!("poker:game_state:{chat_id}")
}

/// How long a saved game-state document is retained by the durable store
/// before it would be eligible for expiry. Hands are short-lived relative to
/// this window; it exists so abandoned tables don't accumulate forever.
#[derive(Debug, Clone, Copy)]
pub struct StateStoreConfig {
    pub ttl: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Versioned load/save over an opaque `GameState` document, keyed by chat.
/// A chat with no document is reported as `None` - there is no hand in
/// progress - rather than a synthesized zero-value state, since
/// `GameState`'s player/stage/pot contract has no meaningful default absent
/// an actual game (see DESIGN.md).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_with_version(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<(GameState, u64)>, StateStoreError>;

    /// Persists `state` under `chat_id` iff the store's current version
    /// equals `expected_version`; on success the stored version becomes
    /// `expected_version + 1`. Returns `false` on version mismatch, leaving
    /// both the store and `state` untouched.
    async fn save_with_version(
        &self,
        chat_id: ChatId,
        state: &GameState,
        expected_version: u64,
    ) -> Result<bool, StateStoreError>;
}

pub struct KvStateStore {
    kv: Arc<dyn KvStore>,
    config: StateStoreConfig,
}

impl KvStateStore {
    pub fn new(kv: Arc<dyn KvStore>, config: StateStoreConfig) -> Self {
        Self { kv, config }
    }
}

#[async_trait]
impl StateStore for KvStateStore {
    async fn load_with_version(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<(GameState, u64)>, StateStoreError> {
        let key = state_key(chat_id);
        match self.kv.game_state_load(&key).await? {
            None => Ok(None),
            Some((raw, version)) => {
                let state: GameState = serde_json::from_str(&raw)
                    .map_err(|source| StateStoreError::Decode { key, source })?;
                Ok(Some((state, version)))
            }
        }
    }

    async fn save_with_version(
        &self,
        chat_id: ChatId,
        state: &GameState,
        expected_version: u64,
    ) -> Result<bool, StateStoreError> {
        let key = state_key(chat_id);
        let raw = serde_json::to_string(state).expect("game state always serializes");
        let saved = self
            .kv
            .game_state_save(&key, &raw, expected_version, self.config.ttl)
            .await?;
        if saved {
            tracing::debug!(chat_id, expected_version, "saved game state");
        } else {
            tracing::warn!(chat_id, expected_version, "game state save lost the CAS race");
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poker_core::PlayerState;
    use poker_kv::memory::MemoryKvStore;

    fn sample() -> GameState {
        GameState {
            version: 0,
            players: vec![PlayerState {
                user_id: 1,
                chips: 1000,
                current_bet: 0,
                folded: false,
            }],
            current_bet: 100,
            current_player_id: Some(1),
            stage: "preflop".to_string(),
            pot: 0,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn absent_chat_reports_no_game() {
        let store = KvStateStore::new(Arc::new(MemoryKvStore::new()), StateStoreConfig::default());
        assert!(store.load_with_version(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_at_the_next_version() {
        let store = KvStateStore::new(Arc::new(MemoryKvStore::new()), StateStoreConfig::default());
        assert!(store.save_with_version(1, &sample(), 0).await.unwrap());
        let (loaded, version) = store.load_with_version(1).await.unwrap().unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded.pot, 0);
    }

    #[tokio::test]
    async fn stale_expected_version_is_rejected_without_mutating_the_store() {
        let store = KvStateStore::new(Arc::new(MemoryKvStore::new()), StateStoreConfig::default());
        store.save_with_version(1, &sample(), 0).await.unwrap();
        let mut stale_update = sample();
        stale_update.pot = 999;
        assert!(!store.save_with_version(1, &stale_update, 0).await.unwrap());
        let (loaded, version) = store.load_with_version(1).await.unwrap().unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded.pot, 0);
    }
}
