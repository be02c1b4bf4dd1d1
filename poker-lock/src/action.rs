use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use poker_kv::{KvError, KvStore};

/// A durable per-chat-user-action marker, acquired with `SET NX` semantics
/// and released with a compare-and-delete so a stale holder can never clear
/// someone else's lock. Grounded on `utils/locks.py::acquire_action_lock`.
pub struct ActionLockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    released: bool,
}

impl ActionLockGuard {
    pub async fn release(mut self) -> Result<bool, KvError> {
        self.released = true;
        self.kv.delete_if_eq(&self.key, &self.token).await
    }
}

impl Drop for ActionLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let kv = self.kv.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(err) = kv.delete_if_eq(&key, &token).await {
                tracing::warn!(key = %key, error = %err, "failed to release action lock on drop");
            }
        });
    }
}

fn action_lock_key(chat_id: i64, user_id: i64, action: &str) -> String {
    format!("action:lock:{chat_id}:{user_id}:{action}")
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    let raw: u128 = rng.gen();
    format!("{raw:032x}")
}

/// Attempts a single, non-blocking acquisition of the action token. Returns
/// `None` if another holder already has it.
pub async fn acquire_action_lock(
    kv: Arc<dyn KvStore>,
    chat_id: i64,
    user_id: i64,
    action: &str,
    ttl: Duration,
) -> Result<Option<ActionLockGuard>, KvError> {
    let key = action_lock_key(chat_id, user_id, action);
    let token = random_token();
    let acquired = kv.set_nx(&key, &token, ttl).await?;
    if !acquired {
        return Ok(None);
    }
    Ok(Some(ActionLockGuard {
        kv,
        key,
        token,
        released: false,
    }))
}

/// Counts keys matching `action:lock:{chat_id}:*`, used to report a caller's
/// rough position in the contention queue for this chat's action locks.
/// Grounded on `utils/locks.py::_estimate_queue_position`.
pub async fn estimate_queue_position(kv: &dyn KvStore, chat_id: i64) -> Result<usize, KvError> {
    let pattern = format!("action:lock:{chat_id}:*");
    Ok(kv.scan(&pattern).await?.len())
}

/// Retries `acquire_action_lock` with a fixed backoff until it succeeds or
/// `max_wait` elapses, invoking `on_progress` with the queue position - but
/// only when that position actually changes from the previous callback, so
/// a caller isn't spammed with identical updates while parked behind the
/// same set of holders.
pub async fn acquire_action_lock_with_progress<F>(
    kv: Arc<dyn KvStore>,
    chat_id: i64,
    user_id: i64,
    action: &str,
    ttl: Duration,
    max_wait: Duration,
    poll_interval: Duration,
    mut on_progress: F,
) -> Result<Option<ActionLockGuard>, KvError>
where
    F: FnMut(usize),
{
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut last_reported: Option<usize> = None;
    loop {
        if let Some(guard) = acquire_action_lock(kv.clone(), chat_id, user_id, action, ttl).await? {
            return Ok(Some(guard));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        let position = estimate_queue_position(kv.as_ref(), chat_id).await?;
        if last_reported != Some(position) {
            on_progress(position);
            last_reported = Some(position);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use poker_kv::memory::MemoryKvStore;

    #[tokio::test]
    async fn second_acquisition_is_refused_until_release() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let first = acquire_action_lock(kv.clone(), 1, 2, "raise", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = acquire_action_lock(kv.clone(), 1, 2, "raise", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(second.is_none());

        first.unwrap().release().await.unwrap();
        let third = acquire_action_lock(kv.clone(), 1, 2, "raise", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn queue_position_counts_outstanding_action_locks() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let _a = acquire_action_lock(kv.clone(), 9, 1, "call", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let _b = acquire_action_lock(kv.clone(), 9, 2, "fold", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(estimate_queue_position(kv.as_ref(), 9).await.unwrap(), 2);
        assert_eq!(estimate_queue_position(kv.as_ref(), 404).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_callback_dedupes_identical_positions() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let holder = acquire_action_lock(kv.clone(), 3, 1, "check", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let reports: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let reports_for_task = reports.clone();
        let waiter_kv = kv.clone();
        let waiter = tokio::spawn(async move {
            acquire_action_lock_with_progress(
                waiter_kv,
                3,
                2,
                "check",
                Duration::from_secs(5),
                Duration::from_millis(300),
                Duration::from_millis(20),
                |position| reports_for_task.lock().unwrap().push(position),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        holder.release().await.unwrap();
        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_some());
        // The queue position stayed at 1 (just the waiter's own rival) the
        // whole time, so the dedup guard should have reported it only once.
        assert_eq!(*reports.lock().unwrap(), vec![1]);
    }
}
