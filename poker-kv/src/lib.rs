// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A minimal set of scripted atomic primitives over a remote KV store. Each
//! primitive plays the role of a server-side Lua script in the original
//! Redis-backed bot: the caller supplies keys and arguments and gets back a
//! bit-stable outcome. `memory` backs tests and the `redis_pool` mocks of
//! the original test suite; `rocks` is the durable production store.

pub mod memory;
pub mod rocks;

use std::time::Duration;

use async_trait::async_trait;
use poker_core::Reservation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("value at {key} was not valid reservation json: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of `reservation_commit`, with the exact string the original
/// Lua-script-backed store returned. Callers that log or forward this
/// outcome must use `as_str`/`Display`, not the variant's Rust name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Ok,
    AlreadyCommitted,
    Missing,
    /// Any other terminal status (e.g. `rolled_back`, `expired`) returned
    /// verbatim, matching the original's "raw status otherwise" contract.
    Other(String),
}

impl CommitOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            CommitOutcome::Ok => "ok",
            CommitOutcome::AlreadyCommitted => "committed",
            CommitOutcome::Missing => "missing",
            CommitOutcome::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `reservation_rollback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack,
    /// committed -> rolled_back, only reachable when `allow_committed` was set.
    Compensated,
    /// Still committed and `allow_committed` was false.
    StillCommitted,
    Missing,
    Other(String),
}

impl RollbackOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            RollbackOutcome::RolledBack => "rolled_back",
            RollbackOutcome::Compensated => "compensated",
            RollbackOutcome::StillCommitted => "committed",
            RollbackOutcome::Missing => "missing",
            RollbackOutcome::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scripted atomic primitives plus the plain list/hash/key operations
/// the lock service and DLQ need. Implementors must honor the exact return
/// contracts documented on each method - callers rely on them being
/// bit-stable.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Creates the reservation record if, and only if, `key` did not
    /// already exist. Returns `true` iff this call created it.
    async fn reservation_create(
        &self,
        key: &str,
        reservation: &Reservation,
    ) -> Result<bool, KvError>;

    /// Fetches the current reservation record, if any.
    async fn reservation_get(&self, key: &str) -> Result<Option<Reservation>, KvError>;

    /// Atomically transitions pending -> committed.
    async fn reservation_commit(&self, key: &str) -> Result<CommitOutcome, KvError>;

    /// Atomically transitions pending -> rolled_back (or, when
    /// `allow_committed` is set, committed -> rolled_back).
    async fn reservation_rollback(
        &self,
        key: &str,
        allow_committed: bool,
        reason: &str,
    ) -> Result<RollbackOutcome, KvError>;

    /// Conditionally persists `state_json` under `key`, succeeding only if
    /// the stored version equals `expected_version`; on success the stored
    /// version becomes `expected_version + 1`.
    async fn game_state_save(
        &self,
        key: &str,
        state_json: &str,
        expected_version: u64,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Loads the raw state document and its stored version, if present.
    async fn game_state_load(&self, key: &str) -> Result<Option<(String, u64)>, KvError>;

    /// Appends `value` to the head of the list at `key` (used for the DLQ
    /// and the smart-retry waiter queue).
    async fn lpush(&self, key: &str, value: &str) -> Result<i64, KvError>;

    /// Removes up to one occurrence of `value` from the list at `key`.
    async fn lrem(&self, key: &str, value: &str) -> Result<i64, KvError>;

    /// Returns the length of the list at `key`.
    async fn llen(&self, key: &str) -> Result<i64, KvError>;

    /// Sets `key` to `value` only if it does not already exist, with a TTL.
    /// Returns `true` iff the key was set by this call.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Unconditionally sets `key` to `value` with a TTL, overwriting any
    /// prior value. Used to persist configuration documents such as
    /// `system_constants` (no CAS semantics are needed here: the rollout
    /// gate is the sole writer of its own percentage).
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Fetches the raw string value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Deletes `key` (ignoring whether it existed). Returns `true` iff a
    /// key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Deletes `key` only if its current value equals `expected_value`
    /// (used to release action-lock tokens without a race).
    async fn delete_if_eq(&self, key: &str, expected_value: &str) -> Result<bool, KvError>;

    /// Returns `true` iff `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Resets the TTL on `key`. Returns `true` iff the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Returns every currently-live key matching `pattern`, where `pattern`
    /// is a prefix ending in `*` (as used by `action:lock:{chat}:*`) or an
    /// exact key.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}
