use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient chips: need {needed}, have {have}")]
    InsufficientFunds { needed: u64, have: u64 },

    #[error("player {user_id} not found in chat {chat_id}")]
    PlayerNotFound { user_id: i64, chat_id: i64 },

    #[error("durable backend error: {0}")]
    Backend(#[from] poker_kv::KvError),

    #[error("refund for reservation {reservation_id} failed and was sent to the dead-letter queue")]
    RefundFailed { reservation_id: String },
}
