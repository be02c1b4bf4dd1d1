use serde::{Deserialize, Serialize};

use crate::GameState;

/// The one and only outcome type the betting orchestrator returns. No exit
/// point ever raises to its caller; every failure is folded into this shape
/// after whatever compensation (rollback / refund / DLQ) the stage requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BettingResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<GameState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
}

impl BettingResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            new_state: None,
            reservation_id: None,
        }
    }

    pub fn success(message: impl Into<String>, new_state: GameState, reservation_id: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            new_state: Some(new_state),
            reservation_id,
        }
    }
}
