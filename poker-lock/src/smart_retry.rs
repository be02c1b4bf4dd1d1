use std::sync::Arc;
use std::time::Duration;

use poker_kv::KvStore;

use crate::error::{LockError, LockOwner};
use crate::hierarchy::LockKind;
use crate::service::{LockGuard, LockService};

/// Tunables for `acquire_with_smart_retry`, mirroring the constants in
/// `utils/locks.py`: a fixed backoff schedule, a jitter fraction applied to
/// each sleep, and a waiter-queue depth past which a caller gives up rather
/// than join an already-overloaded queue.
#[derive(Debug, Clone)]
pub struct SmartRetryConfig {
    pub backoff_schedule: Vec<Duration>,
    pub jitter_fraction: f64,
    pub queue_depth_threshold: i64,
    pub grace_buffer: Duration,
}

impl Default for SmartRetryConfig {
    fn default() -> Self {
        Self {
            backoff_schedule: vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
            ],
            jitter_fraction: 0.2,
            queue_depth_threshold: 8,
            grace_buffer: Duration::from_millis(50),
        }
    }
}

fn jittered(base: Duration, jitter_fraction: f64) -> Duration {
    let jitter: f64 = rand::random::<f64>() * jitter_fraction;
    base.mul_f64(1.0 + jitter)
}

fn queue_key(lock_key: &str) -> String {
    format!("lock_queue:{lock_key}")
}

/// Acquires a hierarchy lock with distributed-contention awareness: before
/// joining, the caller samples the waiter queue depth in the KV store and
/// aborts early if it is already past threshold, rather than piling on top
/// of a queue nobody is making progress through. While waiting, this
/// caller's own presence is tracked in the same queue so siblings can make
/// the same decision. Grounded on `utils/locks.py::_acquire_lock_with_smart_retry`
/// and `tests/test_smart_lock_retry.py`.
pub async fn acquire_with_smart_retry(
    service: &LockService,
    kv: Arc<dyn KvStore>,
    key: &str,
    kind: LockKind,
    owner: LockOwner,
    config: &SmartRetryConfig,
) -> Result<LockGuard, LockError> {
    let waiter_token = format!("{owner}");
    let queue = queue_key(key);

    let depth = kv.llen(&queue).await?;
    if depth >= config.queue_depth_threshold {
        metrics::counter!("lock_retry_congested_total", "type" => kind_label(kind)).increment(1);
        return Err(LockError::QueueCongested {
            key: key.to_string(),
            depth,
            threshold: config.queue_depth_threshold,
        });
    }

    kv.lpush(&queue, &waiter_token).await?;
    let result = run_retry_loop(service, key, kind, owner, config).await;
    kv.lrem(&queue, &waiter_token).await?;
    result
}

async fn run_retry_loop(
    service: &LockService,
    key: &str,
    kind: LockKind,
    owner: LockOwner,
    config: &SmartRetryConfig,
) -> Result<LockGuard, LockError> {
    let label = kind_label(kind);
    let attempts = config.backoff_schedule.len() as u32 + 1;

    for attempt in 0..attempts {
        metrics::counter!("lock_retry_attempts_total", "type" => label, "attempt" => attempt.to_string())
            .increment(1);

        let per_attempt_timeout = config
            .backoff_schedule
            .get(attempt as usize)
            .copied()
            .unwrap_or_else(|| config.grace_buffer)
            + config.grace_buffer;

        match service.acquire_any(key, kind, owner, per_attempt_timeout).await {
            Ok(guard) => {
                metrics::counter!("lock_retry_success_total", "type" => label).increment(1);
                metrics::counter!(
                    "lock_acquisition_success_total",
                    "type" => label,
                    "attempt" => attempt.to_string()
                )
                .increment(1);
                return Ok(guard);
            }
            Err(err @ LockError::LockOrder { .. }) => {
                // Hierarchy violations are never transient; retrying cannot help.
                return Err(err);
            }
            Err(_) if (attempt as usize) < config.backoff_schedule.len() => {
                let sleep_for = jittered(config.backoff_schedule[attempt as usize], config.jitter_fraction);
                tokio::time::sleep(sleep_for).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(LockError::Timeout {
        key: key.to_string(),
        attempts,
    })
}

fn kind_label(kind: LockKind) -> &'static str {
    match kind {
        LockKind::TableRead => "table_read",
        LockKind::TableWrite => "table_write",
        LockKind::Player => "player",
        LockKind::Pot => "pot",
        LockKind::Deck => "deck",
        LockKind::Betting => "betting",
        LockKind::Wallet => "wallet",
        LockKind::Chat => "chat",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poker_kv::memory::MemoryKvStore;

    #[tokio::test]
    async fn congested_queue_aborts_before_joining() {
        let service = LockService::default();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mut config = SmartRetryConfig::default();
        config.queue_depth_threshold = 1;

        for i in 0..2 {
            kv.lpush("lock_queue:pot:5", &format!("waiter-{i}")).await.unwrap();
        }

        let err = acquire_with_smart_retry(&service, kv.clone(), "pot:5", LockKind::Pot, 1, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::QueueCongested { .. }));
        // Aborting early must not have added a third waiter.
        assert_eq!(kv.llen("lock_queue:pot:5").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn uncontended_lock_is_acquired_on_first_attempt() {
        let service = LockService::default();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let config = SmartRetryConfig::default();

        let guard = acquire_with_smart_retry(&service, kv.clone(), "deck:1", LockKind::Deck, 1, &config)
            .await
            .unwrap();
        drop(guard);
        assert_eq!(kv.llen("lock_queue:deck:1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn waiter_token_is_removed_even_on_failure() {
        let service = LockService::default();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mut config = SmartRetryConfig::default();
        config.backoff_schedule = vec![Duration::from_millis(5)];

        // Hold the table write lock under owner 1, then owner 2 tries to
        // take the wallet lock first (ascending is fine) and finally
        // attempts table_write, which would be a descent and fails fast.
        let _table = service.table_write_lock(77, 1, Duration::from_secs(1)).await.unwrap();
        let _wallet = service.wallet_lock(3, 2, None).await.unwrap();

        let err = acquire_with_smart_retry(
            &service,
            kv.clone(),
            "table:77",
            LockKind::TableWrite,
            2,
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LockError::LockOrder { .. }));
        assert_eq!(kv.llen("lock_queue:table:77").await.unwrap(), 0);
    }
}
