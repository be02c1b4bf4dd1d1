use poker_core::{BettingAction, Chips, GameState, PlayerState, UserId};

/// Phase 1 validation result: either a required chip amount to reserve, or
/// the exact user-facing rejection message. Wording mirrors
/// `betting_handler.py::_validate_action`.
pub fn validate(state: &GameState, user_id: UserId, action: &BettingAction, amount: Option<Chips>) -> Result<Chips, String> {
    let player = find_player(state, user_id)?;
    if player.folded {
        return Err("You have already folded".to_string());
    }
    let to_call = state.current_bet.saturating_sub(player.current_bet);
    match action {
        BettingAction::Fold => Ok(0),
        BettingAction::Check => {
            if to_call > 0 {
                Err("Cannot check - must call or fold".to_string())
            } else {
                Ok(0)
            }
        }
        BettingAction::Call => Ok(to_call),
        BettingAction::Raise => match amount {
            Some(amount) if amount > state.current_bet => Ok(amount - player.current_bet),
            _ => Err("Invalid raise amount".to_string()),
        },
        BettingAction::AllIn => Ok(player.chips),
        BettingAction::Unknown(raw) => Err(format!("Unknown action: {raw}")),
    }
}

fn find_player(state: &GameState, user_id: UserId) -> Result<&PlayerState, String> {
    state
        .player(user_id)
        .ok_or_else(|| "You are not in this game".to_string())
}
