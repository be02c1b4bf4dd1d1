use std::fmt;

/// A player's requested betting action. Unknown actions are preserved
/// verbatim so rejection messages can echo what the caller sent, matching
/// the original handler's `f"Unknown action: {action}"` behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BettingAction {
    Fold,
    Check,
    Call,
    Raise,
    AllIn,
    Unknown(String),
}

impl BettingAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "fold" => BettingAction::Fold,
            "check" => BettingAction::Check,
            "call" => BettingAction::Call,
            "raise" => BettingAction::Raise,
            "all_in" => BettingAction::AllIn,
            other => BettingAction::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BettingAction::Fold => "fold",
            BettingAction::Check => "check",
            BettingAction::Call => "call",
            BettingAction::Raise => "raise",
            BettingAction::AllIn => "all_in",
            BettingAction::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for BettingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_round_trips_its_raw_text() {
        let action = BettingAction::parse("surrender");
        assert_eq!(action, BettingAction::Unknown("surrender".to_string()));
        assert_eq!(action.as_str(), "surrender");
    }
}
