use serde::{Deserialize, Serialize};

use crate::{ChatId, Chips, UserId};

/// The orchestrator's view of a single seated player. Anything the game
/// engine needs beyond this contract travels in `GameState::extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub user_id: UserId,
    pub chips: Chips,
    pub current_bet: Chips,
    pub folded: bool,
}

/// An opaque game-state document keyed by chat id. The orchestrator never
/// inspects anything beyond this small contract; everything else the game
/// engine needs rides along in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub version: u64,
    pub players: Vec<PlayerState>,
    pub current_bet: Chips,
    pub current_player_id: Option<UserId>,
    pub stage: String,
    pub pot: Chips,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GameState {
    pub fn player(&self, user_id: UserId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn player_mut(&mut self, user_id: UserId) -> Option<&mut PlayerState> {
        self.players.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Chips still owed by `user_id` to match the current bet, clamped at
    /// zero (a player can never owe a negative amount).
    pub fn to_call(&self, user_id: UserId) -> Option<Chips> {
        self.player(user_id)
            .map(|p| self.current_bet.saturating_sub(p.current_bet))
    }
}

/// Default chat id used when synthesizing a new game-state document; the
/// store, not this type, is responsible for keying documents by chat.
pub const DEFAULT_VERSION: u64 = 0;

pub fn default_chat_key(chat_id: ChatId) -> String {
    format!("poker:game_state:{chat_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GameState {
        GameState {
            version: 1,
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

    #[test]
    fn to_call_is_clamped_at_zero() {
        let state = sample();
        assert_eq!(state.to_call(1), Some(100));
    }

    #[test]
    fn to_call_is_none_for_unseated_players() {
        let state = sample();
        assert_eq!(state.to_call(999), None);
    }
}
