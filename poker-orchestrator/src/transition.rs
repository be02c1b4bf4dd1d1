use poker_core::{BettingAction, Chips, GameState, UserId};

/// The pure state-transition function the orchestrator treats as an opaque
/// collaborator (`spec` §6 "game engine hook" / `apply_betting_action`). No
/// hand ranking or side-pot math lives here or anywhere in this crate -
/// that evaluation is out of scope; a real deployment supplies its own
/// `GameTransition` with the full rules engine behind it.
pub trait GameTransition: Send + Sync {
    fn apply(&self, state: &GameState, user_id: UserId, action: &BettingAction, required_amount: Chips) -> GameState;
}

/// Minimal bookkeeping transition: moves chips from the acting player's
/// stack into the pot and tracks the table's current bet. Sufficient to
/// exercise the orchestrator end-to-end; not a poker rules engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransition;

impl GameTransition for DefaultTransition {
    fn apply(&self, state: &GameState, user_id: UserId, action: &BettingAction, required_amount: Chips) -> GameState {
        let mut next = state.clone();
        let Some(player) = next.player_mut(user_id) else {
            return next;
        };
        match action {
            BettingAction::Fold => player.folded = true,
            BettingAction::Check => {}
            BettingAction::Call | BettingAction::Raise | BettingAction::AllIn => {
                player.chips = player.chips.saturating_sub(required_amount);
                player.current_bet += required_amount;
                next.pot += required_amount;
                if player.current_bet > next.current_bet {
                    next.current_bet = player.current_bet;
                }
            }
            BettingAction::Unknown(_) => {}
        }
        next
    }
}
