use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("durable backend error: {0}")]
    Backend(#[from] poker_kv::KvError),

    #[error("game state at {key} was not valid json: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
