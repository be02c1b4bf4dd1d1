use thiserror::Error;

/// Identifies the task/request that owns a held lock. Rather than reaching
/// for tokio's unstable task-id, the owner is an explicit token threaded
/// through every acquire/release call - the "context-carried slice"
/// representation the hierarchy tracking needs.
pub type LockOwner = u64;

#[derive(Debug, Error)]
pub enum LockError {
    /// An acquisition would have descended below the deepest level already
    /// held by this owner. No lock was acquired.
    #[error("lock order violation: owner already holds level {held}, attempted level {attempted} for key '{key}'")]
    LockOrder {
        key: String,
        held: u8,
        attempted: u8,
    },

    #[error("timed out acquiring lock '{key}' after {attempts} attempt(s)")]
    Timeout { key: String, attempts: u32 },

    #[error("lock queue for '{key}' is congested (depth {depth} exceeds threshold {threshold})")]
    QueueCongested {
        key: String,
        depth: i64,
        threshold: i64,
    },

    #[error("durable backend error: {0}")]
    Backend(#[from] poker_kv::KvError),

    #[error("acquisition for '{key}' was cancelled")]
    Cancelled { key: String },
}
