// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-chat sliding-window health counters and the background monitor that
//! halves the rollout percentage on sustained unhealthy windows. Grounded
//! on `utils/rollout_metrics.py::{RolloutMetrics, RolloutMonitor}` and the
//! aggregate view in `health_endpoints.py::fine_grained_locks_health`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use poker_core::ChatId;
use poker_kv::KvStore;
use poker_rollout::{load_system_constants, persist_system_constants, RolloutGate};

/// One chat's rolling window of lock and action samples.
pub struct HealthWindow {
    pub lock_wait_times: Vec<f64>,
    pub lock_hold_times: Vec<f64>,
    pub lock_errors: u64,
    pub action_durations: Vec<f64>,
    pub action_successes: u64,
    pub action_failures: u64,
    pub window_start: Instant,
}

impl Default for HealthWindow {
    fn default() -> Self {
        Self {
            lock_wait_times: Vec::new(),
            lock_hold_times: Vec::new(),
            lock_errors: 0,
            action_durations: Vec::new(),
            action_successes: 0,
            action_failures: 0,
            window_start: Instant::now(),
        }
    }
}

impl HealthWindow {
    /// Unhealthy when the action error rate exceeds 5%, the lock error rate
    /// exceeds 1%, or the mean action duration exceeds 200ms. Any metric
    /// with zero samples is skipped rather than treated as a failure.
    pub fn is_healthy(&self) -> bool {
        let total_actions = self.action_successes + self.action_failures;
        if total_actions > 0 {
            let error_rate = self.action_failures as f64 / total_actions as f64;
            if error_rate > 0.05 {
                return false;
            }
        }

        let total_locks = self.lock_wait_times.len() as u64 + self.lock_errors;
        if total_locks > 0 {
            let lock_error_rate = self.lock_errors as f64 / total_locks as f64;
            if lock_error_rate > 0.01 {
                return false;
            }
        }

        if !self.action_durations.is_empty() {
            let avg = self.action_durations.iter().sum::<f64>() / self.action_durations.len() as f64;
            if avg > 0.2 {
                return false;
            }
        }

        true
    }

    pub fn reset(&mut self) {
        self.lock_wait_times.clear();
        self.lock_hold_times.clear();
        self.lock_errors = 0;
        self.action_durations.clear();
        self.action_successes = 0;
        self.action_failures = 0;
        self.window_start = Instant::now();
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub window: Duration,
    pub unhealthy_threshold: u32,
    pub system_constants_key: String,
    pub system_constants_ttl: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            unhealthy_threshold: 3,
            system_constants_key: poker_rollout::SYSTEM_CONSTANTS_KEY.to_string(),
            system_constants_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Aggregate view across every chat's window, mirroring
/// `health_endpoints.py::fine_grained_locks_health`'s response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub healthy: bool,
    pub metrics: AggregateHealthMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealthMetrics {
    pub total_actions: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub lock_error_rate: f64,
}

/// Tracks per-chat windows, evaluates health on a periodic tick, and
/// triggers an automatic rollback (halving the rollout percentage) after
/// `unhealthy_threshold` consecutive unhealthy windows for a chat.
pub struct HealthMonitor {
    windows: RwLock<HashMap<ChatId, HealthWindow>>,
    unhealthy_counts: RwLock<HashMap<ChatId, u32>>,
    config: HealthMonitorConfig,
    gate: Arc<RolloutGate>,
    kv: Arc<dyn KvStore>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, gate: Arc<RolloutGate>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            unhealthy_counts: RwLock::new(HashMap::new()),
            config,
            gate,
            kv,
        }
    }

    pub fn record_lock_metrics(&self, chat_id: ChatId, wait: Duration, hold: Duration, success: bool) {
        let mut windows = self.windows.write();
        let window = windows.entry(chat_id).or_default();
        if success {
            window.lock_wait_times.push(wait.as_secs_f64());
            window.lock_hold_times.push(hold.as_secs_f64());
        } else {
            window.lock_errors += 1;
        }
    }

    pub fn record_action_metrics(&self, chat_id: ChatId, duration: Duration, success: bool) {
        let mut windows = self.windows.write();
        let window = windows.entry(chat_id).or_default();
        window.action_durations.push(duration.as_secs_f64());
        if success {
            window.action_successes += 1;
        } else {
            window.action_failures += 1;
        }
    }

    /// Evaluates every chat whose window has run its full length, resets
    /// each one it inspects, and rolls back any chat that has now reached
    /// `unhealthy_threshold` consecutive unhealthy windows. Returns the
    /// chats the rollback was triggered for.
    pub async fn check_health(&self) -> Vec<ChatId> {
        let mut newly_unhealthy = Vec::new();
        {
            let mut windows = self.windows.write();
            let mut unhealthy_counts = self.unhealthy_counts.write();
            for (chat_id, window) in windows.iter_mut() {
                if window.window_start.elapsed() < self.config.window {
                    continue;
                }
                if window.is_healthy() {
                    unhealthy_counts.insert(*chat_id, 0);
                } else {
                    let count = unhealthy_counts.entry(*chat_id).or_insert(0);
                    *count += 1;
                    tracing::warn!(
                        chat_id,
                        consecutive_unhealthy_windows = *count,
                        "unhealthy rollout metrics detected"
                    );
                    if *count >= self.config.unhealthy_threshold {
                        newly_unhealthy.push(*chat_id);
                    }
                }
                window.reset();
            }
        }

        if !newly_unhealthy.is_empty() {
            self.trigger_rollback(&newly_unhealthy).await;
        }
        newly_unhealthy
    }

    async fn trigger_rollback(&self, unhealthy_chats: &[ChatId]) {
        tracing::error!(
            critical = true,
            reason = "unhealthy_metrics",
            affected_chats = unhealthy_chats.len(),
            "triggering automatic rollback"
        );

        let current_percentage = self.gate.rollout_percentage();
        let new_percentage = current_percentage / 2;

        match load_system_constants(self.kv.as_ref(), &self.config.system_constants_key).await {
            Ok(mut constants) => {
                constants.lock_manager.rollout_percentage = new_percentage;
                if let Err(err) = persist_system_constants(
                    self.kv.as_ref(),
                    &self.config.system_constants_key,
                    &constants,
                    self.config.system_constants_ttl,
                )
                .await
                {
                    tracing::error!(error = %err, "failed to persist rolled-back rollout percentage");
                }
                self.gate.reload(&constants);
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load system_constants for rollback; applying in-memory only");
                self.gate.set_percentage(new_percentage);
            }
        }

        tracing::error!(
            critical = true,
            old_percentage = current_percentage,
            new_percentage,
            "rollback completed"
        );
    }

    /// Spawns the periodic health-check loop. The returned handle's
    /// `abort()` stops it, mirroring the original's cancellable background
    /// task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.config.window).await;
                self.check_health().await;
            }
        })
    }

    pub fn aggregate_health(&self) -> AggregateHealth {
        let windows = self.windows.read();
        let mut total_actions: u64 = 0;
        let mut total_successes: u64 = 0;
        let mut total_failures: u64 = 0;
        let mut lock_errors: u64 = 0;
        let mut total_locks: u64 = 0;

        for window in windows.values() {
            total_actions += window.action_successes + window.action_failures;
            total_successes += window.action_successes;
            total_failures += window.action_failures;
            lock_errors += window.lock_errors;
            total_locks += window.lock_wait_times.len() as u64 + window.lock_errors;
        }

        let error_rate = total_failures as f64 / total_actions.max(1) as f64;
        let lock_error_rate = lock_errors as f64 / total_locks.max(1) as f64;
        let healthy = error_rate < 0.05 && lock_error_rate < 0.01;

        AggregateHealth {
            healthy,
            metrics: AggregateHealthMetrics {
                total_actions,
                success_rate: total_successes as f64 / total_actions.max(1) as f64,
                error_rate,
                lock_error_rate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poker_kv::memory::MemoryKvStore;
    use poker_rollout::{LockManagerSettings, LockRetrySettings, SystemConstants};

    fn gate(percentage: u8) -> Arc<RolloutGate> {
        Arc::new(RolloutGate::new(&SystemConstants {
            lock_manager: LockManagerSettings {
                enable_fine_grained_locks: true,
                rollout_percentage: percentage,
                lock_retry: LockRetrySettings::default(),
            },
            extra: serde_json::Map::new(),
        }))
    }

    #[test]
    fn empty_window_is_healthy() {
        assert!(HealthWindow::default().is_healthy());
    }

    #[test]
    fn high_error_rate_is_unhealthy() {
        let mut window = HealthWindow::default();
        window.action_successes = 1;
        window.action_failures = 1;
        assert!(!window.is_healthy());
    }

    #[test]
    fn high_lock_error_rate_is_unhealthy() {
        let mut window = HealthWindow::default();
        window.lock_wait_times = vec![0.01; 10];
        window.lock_errors = 1;
        assert!(!window.is_healthy());
    }

    #[test]
    fn slow_mean_action_duration_is_unhealthy() {
        let mut window = HealthWindow::default();
        window.action_durations = vec![0.3, 0.25];
        assert!(!window.is_healthy());
    }

    #[tokio::test]
    async fn three_consecutive_unhealthy_windows_trigger_rollback() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let gate = gate(80);
        let mut config = HealthMonitorConfig::default();
        config.window = Duration::from_millis(0);
        config.unhealthy_threshold = 3;
        let monitor = HealthMonitor::new(config, gate.clone(), kv);

        for _ in 0..3 {
            monitor.record_action_metrics(42, Duration::from_millis(10), false);
            let unhealthy = monitor.check_health().await;
            if !unhealthy.is_empty() {
                assert_eq!(unhealthy, vec![42]);
            }
        }
        assert_eq!(gate.rollout_percentage(), 40);
    }

    #[tokio::test]
    async fn a_single_healthy_window_resets_the_unhealthy_counter() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let gate = gate(80);
        let mut config = HealthMonitorConfig::default();
        config.window = Duration::from_millis(0);
        config.unhealthy_threshold = 2;
        let monitor = HealthMonitor::new(config, gate.clone(), kv);

        monitor.record_action_metrics(7, Duration::from_millis(10), false);
        monitor.check_health().await;
        monitor.record_action_metrics(7, Duration::from_millis(10), true);
        monitor.check_health().await;
        monitor.record_action_metrics(7, Duration::from_millis(10), false);
        let unhealthy = monitor.check_health().await;
        assert!(unhealthy.is_empty(), "counter should have reset after the healthy window");
        assert_eq!(gate.rollout_percentage(), 80, "no rollback should have fired");
    }

    #[test]
    fn aggregate_health_matches_the_endpoint_contract() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), gate(50), kv);
        monitor.record_action_metrics(1, Duration::from_millis(10), true);
        monitor.record_action_metrics(1, Duration::from_millis(10), true);
        monitor.record_action_metrics(2, Duration::from_millis(10), false);

        let aggregate = monitor.aggregate_health();
        assert_eq!(aggregate.metrics.total_actions, 3);
        assert!((aggregate.metrics.error_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert!(!aggregate.healthy, "1/3 failures is well past the 5% error-rate threshold");
    }
}
