use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};

use crate::error::{LockError, LockOwner};
use crate::hierarchy::LockKind;
use crate::reentrant::{FastAcquire, ReentrantLock};

/// Tunables for timed acquisition and retry, mirroring `LockManager`'s
/// constructor defaults in the original bot (`default_timeout_seconds=5`,
/// `max_retries=3`, `retry_backoff_seconds=1`).
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub idle_reap_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            idle_reap_after: Duration::from_secs(300),
        }
    }
}

struct PoolEntry {
    lock: Arc<ReentrantLock>,
    last_released: Instant,
}

pub(crate) struct Shared {
    pool: StdMutex<HashMap<String, PoolEntry>>,
    table_locks: StdMutex<HashMap<String, Arc<AsyncRwLock<()>>>>,
    owner_levels: StdMutex<HashMap<LockOwner, Vec<u8>>>,
}

impl Shared {
    fn validate_and_push(&self, key: &str, owner: LockOwner, level: u8) -> Result<(), LockError> {
        let mut levels = self.owner_levels.lock().expect("owner levels poisoned");
        let stack = levels.entry(owner).or_default();
        let held_max = stack.iter().copied().max().unwrap_or(0);
        if level < held_max {
            return Err(LockError::LockOrder {
                key: key.to_string(),
                held: held_max,
                attempted: level,
            });
        }
        stack.push(level);
        Ok(())
    }

    fn pop_level(&self, owner: LockOwner, level: u8) {
        let mut levels = self.owner_levels.lock().expect("owner levels poisoned");
        if let Some(stack) = levels.get_mut(&owner) {
            if let Some(pos) = stack.iter().rposition(|&held| held == level) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                levels.remove(&owner);
            }
        }
    }

    fn touch_released(&self, key: &str) {
        let mut pool = self.pool.lock().expect("pool poisoned");
        if let Some(entry) = pool.get_mut(key) {
            entry.last_released = Instant::now();
        }
    }
}

/// Keyed re-entrant mutexes with hierarchy enforcement, timed acquisition,
/// exponential backoff retry, and distinct table read/write semantics.
/// Grounded on `lock_manager.py::LockManager` and `utils/locks.py`.
pub struct LockService {
    shared: Arc<Shared>,
    config: LockConfig,
}

impl Default for LockService {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl LockService {
    pub fn new(config: LockConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: StdMutex::new(HashMap::new()),
                table_locks: StdMutex::new(HashMap::new()),
                owner_levels: StdMutex::new(HashMap::new()),
            }),
            config,
        }
    }

    fn get_or_create_reentrant(&self, key: &str) -> Arc<ReentrantLock> {
        let mut pool = self.shared.pool.lock().expect("pool poisoned");
        pool.entry(key.to_string())
            .or_insert_with(|| PoolEntry {
                lock: Arc::new(ReentrantLock::new()),
                last_released: Instant::now(),
            })
            .lock
            .clone()
    }

    fn get_or_create_table_lock(&self, key: &str) -> Arc<AsyncRwLock<()>> {
        let mut table_locks = self.shared.table_locks.lock().expect("table locks poisoned");
        table_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncRwLock::new(())))
            .clone()
    }

    /// Acquires the re-entrant mutex for `key` at hierarchy level `kind`,
    /// retrying with exponential backoff until `timeout` (or the configured
    /// default) elapses. Validation happens *after* the uncontended mutex
    /// is taken - it is released immediately if validation then fails.
    pub async fn acquire(
        &self,
        key: &str,
        kind: LockKind,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        let level = kind.level();
        let lock = self.get_or_create_reentrant(key);
        let total_timeout = timeout.unwrap_or(self.config.default_timeout);
        let attempts = self.config.max_retries + 1;

        match lock.try_acquire(owner) {
            FastAcquire::Reentered | FastAcquire::Acquired => {
                return self.finish_acquire(key, level, owner, lock);
            }
            FastAcquire::WouldBlock => {}
        }

        let deadline = Instant::now() + total_timeout;
        for attempt in 0..attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let remaining_attempts = (attempts - attempt) as u32;
            let attempt_timeout = remaining / remaining_attempts.max(1);
            if attempt_timeout.is_zero() {
                break;
            }

            match tokio::time::timeout(attempt_timeout, lock.acquire(owner)).await {
                Ok(()) => return self.finish_acquire(key, level, owner, lock),
                Err(_) => {
                    tracing::warn!(key, attempt, "timed out acquiring lock on this attempt");
                    if attempt + 1 < attempts {
                        let backoff =
                            self.config.retry_backoff.mul_f64(2f64.powi(attempt as i32));
                        let remaining_after = deadline.saturating_duration_since(Instant::now());
                        let sleep_for = backoff.min(remaining_after);
                        if !sleep_for.is_zero() {
                            tokio::time::sleep(sleep_for).await;
                        }
                    }
                }
            }
        }

        Err(LockError::Timeout {
            key: key.to_string(),
            attempts,
        })
    }

    fn finish_acquire(
        &self,
        key: &str,
        level: u8,
        owner: LockOwner,
        lock: Arc<ReentrantLock>,
    ) -> Result<LockGuard, LockError> {
        if let Err(err) = self.shared.validate_and_push(key, owner, level) {
            lock.release(owner);
            return Err(err);
        }
        Ok(LockGuard {
            shared: self.shared.clone(),
            key: key.to_string(),
            level,
            owner,
            payload: GuardPayload::Reentrant(lock),
        })
    }

    pub async fn table_read_lock(
        &self,
        chat_id: i64,
        owner: LockOwner,
    ) -> Result<LockGuard, LockError> {
        self.table_read_lock_by_key(&format!("table:{chat_id}"), owner).await
    }

    async fn table_read_lock_by_key(&self, key: &str, owner: LockOwner) -> Result<LockGuard, LockError> {
        let level = LockKind::TableRead.level();
        let rw = self.get_or_create_table_lock(key);
        let permit = Arc::clone(&rw).read_owned().await;
        self.shared.validate_and_push(key, owner, level)?;
        Ok(LockGuard {
            shared: self.shared.clone(),
            key: key.to_string(),
            level,
            owner,
            payload: GuardPayload::TableRead(permit),
        })
    }

    /// Acquires the exclusive table write lock for `chat_id`, elevating the
    /// owner's held level to 2. Defaults to the 30s timeout a betting
    /// action uses (`spec.md` §5 Timeouts).
    pub async fn table_write_lock(
        &self,
        chat_id: i64,
        owner: LockOwner,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        self.table_write_lock_by_key(&format!("table:{chat_id}"), owner, timeout).await
    }

    async fn table_write_lock_by_key(
        &self,
        key: &str,
        owner: LockOwner,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let level = LockKind::TableWrite.level();
        let rw = self.get_or_create_table_lock(key);
        let permit = tokio::time::timeout(timeout, Arc::clone(&rw).write_owned())
            .await
            .map_err(|_| LockError::Timeout {
                key: key.to_string(),
                attempts: 1,
            })?;
        if let Err(err) = self.shared.validate_and_push(key, owner, level) {
            drop(permit);
            return Err(err);
        }
        Ok(LockGuard {
            shared: self.shared.clone(),
            key: key.to_string(),
            level,
            owner,
            payload: GuardPayload::TableWrite(permit),
        })
    }

    /// Dispatches to the reentrant pool or the table read/write pool
    /// depending on `kind`, so a caller working generically over a
    /// `LockKind` (as the smart-retry wrapper does) doesn't need to match
    /// on it itself. `key` is used verbatim as the pool key in either case.
    pub async fn acquire_any(
        &self,
        key: &str,
        kind: LockKind,
        owner: LockOwner,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        match kind {
            LockKind::TableRead => self.table_read_lock_by_key(key, owner).await,
            LockKind::TableWrite => self.table_write_lock_by_key(key, owner, timeout).await,
            _ => self.acquire(key, kind, owner, Some(timeout)).await,
        }
    }

    pub async fn player_lock(
        &self,
        chat_id: i64,
        player_id: i64,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&format!("player:{chat_id}:{player_id}"), LockKind::Player, owner, timeout)
            .await
    }

    pub async fn pot_lock(
        &self,
        chat_id: i64,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&format!("pot:{chat_id}"), LockKind::Pot, owner, timeout).await
    }

    pub async fn deck_lock(
        &self,
        chat_id: i64,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&format!("deck:{chat_id}"), LockKind::Deck, owner, timeout).await
    }

    pub async fn betting_lock(
        &self,
        chat_id: i64,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&format!("betting:{chat_id}"), LockKind::Betting, owner, timeout)
            .await
    }

    pub async fn wallet_lock(
        &self,
        user_id: i64,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&format!("wallet:{user_id}"), LockKind::Wallet, owner, timeout)
            .await
    }

    pub async fn chat_lock(
        &self,
        chat_id: i64,
        owner: LockOwner,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&format!("chat:{chat_id}"), LockKind::Chat, owner, timeout).await
    }

    /// Sweeps the re-entrant lock pool for entries idle longer than the
    /// configured threshold, removing all qualifying entries in this one
    /// sweep. Never removes a lock that is currently held.
    pub fn reap_idle(&self) -> usize {
        let mut pool = self.shared.pool.lock().expect("pool poisoned");
        let now = Instant::now();
        let idle_after = self.config.idle_reap_after;
        let stale: Vec<String> = pool
            .iter()
            .filter(|(_, entry)| {
                entry.lock.depth() == 0 && now.duration_since(entry.last_released) > idle_after
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            pool.remove(key);
        }
        stale.len()
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool.lock().expect("pool poisoned").len()
    }
}

enum GuardPayload {
    Reentrant(Arc<ReentrantLock>),
    TableRead(OwnedRwLockReadGuard<()>),
    TableWrite(OwnedRwLockWriteGuard<()>),
}

/// RAII handle for a held lock. Dropping it releases the underlying mutex
/// (or decrements re-entrancy depth) and pops this acquisition off the
/// owner's held-level stack.
pub struct LockGuard {
    shared: Arc<Shared>,
    key: String,
    level: u8,
    owner: LockOwner,
    payload: GuardPayload,
}

impl LockGuard {
    pub fn level(&self) -> u8 {
        self.level
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardPayload::Reentrant(lock) = &self.payload {
            lock.release(self.owner);
        }
        self.shared.pop_level(self.owner, self.level);
        self.shared.touch_released(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ascending_acquisitions_are_permitted() {
        let service = LockService::default();
        let wallet = service.wallet_lock(7, 1, None).await.unwrap();
        let table = service.table_write_lock(101, 1, Duration::from_secs(1)).await.unwrap();
        drop(table);
        drop(wallet);
    }

    #[tokio::test]
    async fn descending_acquisition_raises_lock_order_error() {
        let service = LockService::default();
        let _table = service.table_write_lock(102, 1, Duration::from_secs(1)).await.unwrap();
        let err = service.wallet_lock(8, 1, None).await.unwrap_err();
        assert!(matches!(err, LockError::LockOrder { .. }));
    }

    #[tokio::test]
    async fn failed_validation_releases_the_mutex() {
        let service = LockService::default();
        let _table = service.table_write_lock(103, 1, Duration::from_secs(1)).await.unwrap();
        assert!(service.wallet_lock(9, 1, None).await.is_err());
        // Owner 2 can still take the wallet lock: no leaked acquisition.
        let wallet = service.wallet_lock(9, 2, None).await.unwrap();
        drop(wallet);
    }

    #[tokio::test]
    async fn same_owner_reenters_table_write_lock() {
        let service = LockService::default();
        let outer = service.table_write_lock(104, 1, Duration::from_secs(1)).await;
        assert!(outer.is_ok());
        // Table write locks use an RwLock, not the re-entrant mutex, so a
        // second write attempt by the same owner while held would need a
        // larger timeout budget in real use; here we just confirm release.
        drop(outer);
        let again = service.table_write_lock(104, 1, Duration::from_secs(1)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn concurrent_readers_do_not_block_each_other() {
        let service = LockService::default();
        let r1 = service.table_read_lock(105, 1).await.unwrap();
        let r2 = service.table_read_lock(105, 2).await.unwrap();
        drop(r1);
        drop(r2);
    }

    #[tokio::test]
    async fn idle_reap_removes_only_unheld_idle_entries() {
        let mut config = LockConfig::default();
        config.idle_reap_after = Duration::from_millis(0);
        let service = LockService::new(config);
        let guard = service.pot_lock(1, 1, None).await.unwrap();
        assert_eq!(service.reap_idle(), 0, "held lock must not be reaped");
        drop(guard);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(service.reap_idle(), 1);
        assert_eq!(service.pool_size(), 0);
    }
}
