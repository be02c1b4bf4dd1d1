use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use poker_core::{Reservation, ReservationStatus};
use tokio::sync::Mutex;

use crate::{CommitOutcome, KvError, KvStore, RollbackOutcome};

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|deadline| now < deadline).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    reservations: HashMap<String, Reservation>,
    game_states: HashMap<String, (String, u64, Option<Instant>)>,
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// An in-memory `KvStore`, standing in for the original test suite's
/// `_InMemoryActionLockBackend` and the `AsyncMock`-based `redis_pool`
/// fixtures: used in unit/integration tests and as a development backend.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn reservation_create(
        &self,
        key: &str,
        reservation: &Reservation,
    ) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        if inner.reservations.contains_key(key) {
            return Ok(false);
        }
        inner.reservations.insert(key.to_string(), reservation.clone());
        Ok(true)
    }

    async fn reservation_get(&self, key: &str) -> Result<Option<Reservation>, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner.reservations.get(key).cloned())
    }

    async fn reservation_commit(&self, key: &str) -> Result<CommitOutcome, KvError> {
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.get_mut(key) else {
            return Ok(CommitOutcome::Missing);
        };
        match reservation.status {
            ReservationStatus::Pending => {
                reservation.status = ReservationStatus::Committed;
                Ok(CommitOutcome::Ok)
            }
            ReservationStatus::Committed => Ok(CommitOutcome::AlreadyCommitted),
            other => Ok(CommitOutcome::Other(other.to_string())),
        }
    }

    async fn reservation_rollback(
        &self,
        key: &str,
        allow_committed: bool,
        _reason: &str,
    ) -> Result<RollbackOutcome, KvError> {
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.get_mut(key) else {
            return Ok(RollbackOutcome::Missing);
        };
        match reservation.status {
            ReservationStatus::Pending => {
                reservation.status = ReservationStatus::RolledBack;
                Ok(RollbackOutcome::RolledBack)
            }
            ReservationStatus::Committed if allow_committed => {
                reservation.status = ReservationStatus::RolledBack;
                Ok(RollbackOutcome::Compensated)
            }
            ReservationStatus::Committed => Ok(RollbackOutcome::StillCommitted),
            ReservationStatus::RolledBack => Ok(RollbackOutcome::RolledBack),
            other => Ok(RollbackOutcome::Other(other.to_string())),
        }
    }

    async fn game_state_save(
        &self,
        key: &str,
        state_json: &str,
        expected_version: u64,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        let current_version = inner.game_states.get(key).map(|(_, v, _)| *v).unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        let expires_at = Some(Instant::now() + ttl);
        inner.game_states.insert(
            key.to_string(),
            (state_json.to_string(), expected_version + 1, expires_at),
        );
        Ok(true)
    }

    async fn game_state_load(&self, key: &str) -> Result<Option<(String, u64)>, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .game_states
            .get(key)
            .map(|(json, version, _)| (json.clone(), *version)))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64, KvError> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as i64)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<i64, KvError> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        if let Some(pos) = list.iter().position(|item| item == value) {
            list.remove(pos);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn llen(&self, key: &str) -> Result<i64, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map(|list| list.len() as i64).unwrap_or(0))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some(existing) = inner.strings.get(key) {
            if existing.is_live(now) {
                return Ok(false);
            }
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .strings
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.strings.remove(key).is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected_value: &str) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let matches = inner
            .strings
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value == expected_value)
            .unwrap_or(false);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .strings
            .get(key)
            .map(|entry| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some(entry) = inner.strings.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = Some(now + ttl);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let live_keys = inner
            .strings
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone());

        if let Some(prefix) = pattern.strip_suffix('*') {
            Ok(live_keys.filter(|key| key.starts_with(prefix)).collect())
        } else {
            Ok(live_keys.filter(|key| key == pattern).collect())
        }
    }
}
