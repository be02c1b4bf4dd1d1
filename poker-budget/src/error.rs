use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("unknown request category: {0}")]
    UnknownCategory(String),

    #[error("info_threshold must be between 0 (exclusive) and 1 when provided")]
    InvalidInfoThreshold,
}
