use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use poker_core::{Reservation, ReservationStatus};
use rocksdb::DB;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{CommitOutcome, KvError, KvStore, RollbackOutcome};

#[derive(Serialize, Deserialize)]
struct GameStateRecord {
    state_json: String,
    version: u64,
    expires_at: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct StringRecord {
    value: String,
    expires_at: Option<u64>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn is_live(expires_at: Option<u64>) -> bool {
    expires_at.map(|deadline| now_secs() < deadline).unwrap_or(true)
}

/// Durable `KvStore` over RocksDB. RocksDB gives us atomic single-key
/// put/get but not the compare-and-swap transactions the original scripted
/// primitives relied on, so every operation that must be atomic (create,
/// commit, rollback, CAS save) takes an internal async mutex for the
/// duration of its read-modify-write; this mirrors running each primitive
/// as a single server-side transaction.
pub struct RocksKvStore {
    db: Arc<DB>,
    guard: Mutex<()>,
}

impl RocksKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = DB::open_default(path).map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self {
            db: Arc::new(db),
            guard: Mutex::new(()),
        })
    }

    fn reservation_key(key: &str) -> Vec<u8> {
        format!("rsv:{key}").into_bytes()
    }

    fn game_state_key(key: &str) -> Vec<u8> {
        format!("gs:{key}").into_bytes()
    }

    fn string_key(key: &str) -> Vec<u8> {
        format!("str:{key}").into_bytes()
    }

    fn list_key(key: &str) -> Vec<u8> {
        format!("list:{key}").into_bytes()
    }

    fn read_reservation(&self, key: &str) -> Result<Option<Reservation>, KvError> {
        let raw = self
            .db
            .get(Self::reservation_key(key))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let reservation: Reservation = serde_json::from_slice(&bytes)
                    .map_err(|source| KvError::Decode { key: key.to_string(), source })?;
                Ok(Some(reservation))
            }
        }
    }

    fn write_reservation(&self, key: &str, reservation: &Reservation) -> Result<(), KvError> {
        let bytes = serde_json::to_vec(reservation).expect("reservation always serializes");
        self.db
            .put(Self::reservation_key(key), bytes)
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    fn read_string(&self, key: &str) -> Result<Option<StringRecord>, KvError> {
        let raw = self
            .db
            .get(Self::string_key(key))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let record: StringRecord = serde_json::from_slice(&bytes)
                    .map_err(|source| KvError::Decode { key: key.to_string(), source })?;
                Ok(if is_live(record.expires_at) { Some(record) } else { None })
            }
        }
    }

    fn read_list(&self, key: &str) -> Result<VecDeque<String>, KvError> {
        let raw = self
            .db
            .get(Self::list_key(key))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        match raw {
            None => Ok(VecDeque::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| KvError::Decode { key: key.to_string(), source }),
        }
    }

    fn write_list(&self, key: &str, list: &VecDeque<String>) -> Result<(), KvError> {
        let bytes = serde_json::to_vec(list).expect("list always serializes");
        self.db
            .put(Self::list_key(key), bytes)
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}

#[async_trait]
impl KvStore for RocksKvStore {
    async fn reservation_create(
        &self,
        key: &str,
        reservation: &Reservation,
    ) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        if self.read_reservation(key)?.is_some() {
            return Ok(false);
        }
        self.write_reservation(key, reservation)?;
        Ok(true)
    }

    async fn reservation_get(&self, key: &str) -> Result<Option<Reservation>, KvError> {
        let _permit = self.guard.lock().await;
        self.read_reservation(key)
    }

    async fn reservation_commit(&self, key: &str) -> Result<CommitOutcome, KvError> {
        let _permit = self.guard.lock().await;
        let Some(mut reservation) = self.read_reservation(key)? else {
            return Ok(CommitOutcome::Missing);
        };
        let outcome = match reservation.status {
            ReservationStatus::Pending => {
                reservation.status = ReservationStatus::Committed;
                self.write_reservation(key, &reservation)?;
                CommitOutcome::Ok
            }
            ReservationStatus::Committed => CommitOutcome::AlreadyCommitted,
            other => CommitOutcome::Other(other.to_string()),
        };
        Ok(outcome)
    }

    async fn reservation_rollback(
        &self,
        key: &str,
        allow_committed: bool,
        _reason: &str,
    ) -> Result<RollbackOutcome, KvError> {
        let _permit = self.guard.lock().await;
        let Some(mut reservation) = self.read_reservation(key)? else {
            return Ok(RollbackOutcome::Missing);
        };
        let outcome = match reservation.status {
            ReservationStatus::Pending => {
                reservation.status = ReservationStatus::RolledBack;
                self.write_reservation(key, &reservation)?;
                RollbackOutcome::RolledBack
            }
            ReservationStatus::Committed if allow_committed => {
                reservation.status = ReservationStatus::RolledBack;
                self.write_reservation(key, &reservation)?;
                RollbackOutcome::Compensated
            }
            ReservationStatus::Committed => RollbackOutcome::StillCommitted,
            ReservationStatus::RolledBack => RollbackOutcome::RolledBack,
            other => RollbackOutcome::Other(other.to_string()),
        };
        Ok(outcome)
    }

    async fn game_state_save(
        &self,
        key: &str,
        state_json: &str,
        expected_version: u64,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        let raw = self
            .db
            .get(Self::game_state_key(key))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        let current_version = match &raw {
            None => 0,
            Some(bytes) => {
                let record: GameStateRecord = serde_json::from_slice(bytes)
                    .map_err(|source| KvError::Decode { key: key.to_string(), source })?;
                record.version
            }
        };
        if current_version != expected_version {
            return Ok(false);
        }
        let record = GameStateRecord {
            state_json: state_json.to_string(),
            version: expected_version + 1,
            expires_at: Some(now_secs() + ttl.as_secs()),
        };
        let bytes = serde_json::to_vec(&record).expect("game state record always serializes");
        self.db
            .put(Self::game_state_key(key), bytes)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn game_state_load(&self, key: &str) -> Result<Option<(String, u64)>, KvError> {
        let _permit = self.guard.lock().await;
        let raw = self
            .db
            .get(Self::game_state_key(key))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let record: GameStateRecord = serde_json::from_slice(&bytes)
                    .map_err(|source| KvError::Decode { key: key.to_string(), source })?;
                Ok(Some((record.state_json, record.version)))
            }
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64, KvError> {
        let _permit = self.guard.lock().await;
        let mut list = self.read_list(key)?;
        list.push_front(value.to_string());
        let len = list.len() as i64;
        self.write_list(key, &list)?;
        Ok(len)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<i64, KvError> {
        let _permit = self.guard.lock().await;
        let mut list = self.read_list(key)?;
        if let Some(pos) = list.iter().position(|item| item == value) {
            list.remove(pos);
            self.write_list(key, &list)?;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn llen(&self, key: &str) -> Result<i64, KvError> {
        let _permit = self.guard.lock().await;
        Ok(self.read_list(key)?.len() as i64)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        if self.read_string(key)?.is_some() {
            return Ok(false);
        }
        let record = StringRecord {
            value: value.to_string(),
            expires_at: Some(now_secs() + ttl.as_secs()),
        };
        let bytes = serde_json::to_vec(&record).expect("string record always serializes");
        self.db
            .put(Self::string_key(key), bytes)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let _permit = self.guard.lock().await;
        let record = StringRecord {
            value: value.to_string(),
            expires_at: Some(now_secs() + ttl.as_secs()),
        };
        let bytes = serde_json::to_vec(&record).expect("string record always serializes");
        self.db
            .put(Self::string_key(key), bytes)
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let _permit = self.guard.lock().await;
        Ok(self.read_string(key)?.map(|record| record.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        let existed = self.read_string(key)?.is_some();
        self.db
            .delete(Self::string_key(key))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(existed)
    }

    async fn delete_if_eq(&self, key: &str, expected_value: &str) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        let matches = self
            .read_string(key)?
            .map(|record| record.value == expected_value)
            .unwrap_or(false);
        if matches {
            self.db
                .delete(Self::string_key(key))
                .map_err(|e| KvError::Backend(e.to_string()))?;
        }
        Ok(matches)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        Ok(self.read_string(key)?.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let _permit = self.guard.lock().await;
        let Some(mut record) = self.read_string(key)? else {
            return Ok(false);
        };
        record.expires_at = Some(now_secs() + ttl.as_secs());
        let bytes = serde_json::to_vec(&record).expect("string record always serializes");
        self.db
            .put(Self::string_key(key), bytes)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let _permit = self.guard.lock().await;
        let prefix = pattern.strip_suffix('*');
        let iter_prefix = format!("str:{}", prefix.unwrap_or(pattern));
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator(iter_prefix.as_bytes());
        for item in iter {
            let (raw_key, raw_value) = item.map_err(|e| KvError::Backend(e.to_string()))?;
            let Some(key) = raw_key.strip_prefix(b"str:") else {
                continue;
            };
            let key = String::from_utf8_lossy(key).to_string();
            match prefix {
                Some(prefix) => {
                    // `prefix_iterator` has no prefix extractor configured, so it
                    // seeks to `iter_prefix` and then walks the rest of the
                    // keyspace in sorted order. Keys sharing `prefix` form one
                    // contiguous run in that order, so the first key that no
                    // longer starts with it marks the end of the match - we can
                    // stop instead of scanning (and over-counting) the rest of
                    // the store.
                    if !key.starts_with(prefix) {
                        break;
                    }
                }
                None if key != pattern => continue,
                None => {}
            }
            let record: StringRecord = serde_json::from_slice(&raw_value)
                .map_err(|source| KvError::Decode { key: key.clone(), source })?;
            if is_live(record.expires_at) {
                out.push(key);
            }
        }
        Ok(out)
    }
}
