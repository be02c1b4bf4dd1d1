// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Two-phase commit chip reservation. Phase 1 (`reserve_chips`) debits the
//! wallet and persists a pending record; phase 2 finalizes it with either
//! `commit_reservation` or `rollback_reservation`. Grounded on
//! `wallet_service.py::WalletService`.

mod error;
pub mod ledger;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use error::WalletError;
pub use ledger::{InMemoryLedger, WalletLedger};

use poker_core::{epoch_millis, epoch_seconds, make_reservation_id, Reservation, ReservationStatus};
use poker_kv::{CommitOutcome, KvError, KvStore, RollbackOutcome};

fn reservation_key(reservation_id: &str) -> String {
    format!("poker:reservation:{reservation_id}")
}

#[derive(Debug, Clone, Copy)]
pub struct WalletConfig {
    pub reservation_ttl: Duration,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(300),
        }
    }
}

/// Outcome of `reserve_chips`. Mirrors the original's three-way
/// `(bool, Option<str>, str)` return without collapsing insufficient funds
/// (an expected, routine outcome) into the same shape as a backend error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { reservation_id: String },
    InsufficientFunds { needed: u64, available: u64 },
}

/// Manages chip reservations with two-phase commit. Cheap to clone - every
/// field is an `Arc` (or `Copy` config) so a clone can be moved into the
/// auto-expire task spawned by `reserve_chips`.
#[derive(Clone)]
pub struct WalletService {
    ledger: Arc<dyn WalletLedger>,
    kv: Arc<dyn KvStore>,
    dlq_key: Option<String>,
    config: WalletConfig,
}

impl WalletService {
    pub fn new(ledger: Arc<dyn WalletLedger>, kv: Arc<dyn KvStore>, config: WalletConfig) -> Self {
        Self {
            ledger,
            kv,
            dlq_key: Some("poker:wallet:dlq".to_string()),
            config,
        }
    }

    pub fn without_dlq(ledger: Arc<dyn WalletLedger>, kv: Arc<dyn KvStore>, config: WalletConfig) -> Self {
        Self {
            ledger,
            kv,
            dlq_key: None,
            config,
        }
    }

    /// Phase 1: debits `amount` from `user_id`'s chips in `chat_id` and
    /// persists a pending reservation record. Schedules an auto-expire task
    /// that rolls the reservation back with reason `"timeout"` if it is
    /// still pending once the reservation TTL elapses.
    pub async fn reserve_chips(
        &self,
        user_id: i64,
        chat_id: i64,
        amount: u64,
        metadata: std::collections::HashMap<String, String>,
    ) -> Result<ReserveOutcome, WalletError> {
        let start = Instant::now();
        let reservation_id = make_reservation_id(user_id, chat_id, epoch_millis());

        let result = self
            .reserve_chips_inner(user_id, chat_id, amount, metadata, &reservation_id)
            .await;

        let status_label = match &result {
            Ok(ReserveOutcome::Reserved { .. }) => "success",
            Ok(ReserveOutcome::InsufficientFunds { .. }) => "insufficient_funds",
            Err(_) => "error",
        };
        metrics::counter!("poker_wallet_reserve_total", "status" => status_label).increment(1);
        metrics::histogram!("poker_wallet_operation_duration_seconds", "operation" => "reserve")
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn reserve_chips_inner(
        &self,
        user_id: i64,
        chat_id: i64,
        amount: u64,
        metadata: std::collections::HashMap<String, String>,
        reservation_id: &str,
    ) -> Result<ReserveOutcome, WalletError> {
        let balance = self.ledger.balance(user_id, chat_id).await?;
        if balance < amount {
            tracing::warn!(
                reservation_id,
                needed = amount,
                available = balance,
                "insufficient funds for reservation"
            );
            return Ok(ReserveOutcome::InsufficientFunds {
                needed: amount,
                available: balance,
            });
        }

        self.ledger.deduct(user_id, chat_id, amount).await?;

        let reservation = Reservation::new(
            reservation_id.to_string(),
            user_id,
            chat_id,
            amount,
            metadata,
        );
        match self
            .kv
            .reservation_create(&reservation_key(reservation_id), &reservation)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Reservation ids embed millisecond time plus user/chat, so a
                // collision means a caller reused an id; undo the debit.
                let _ = self.ledger.credit(user_id, chat_id, amount).await;
                return Err(WalletError::Backend(KvError::Backend(format!(
                    "reservation id {reservation_id} already exists"
                ))));
            }
            Err(err) => {
                let _ = self.ledger.credit(user_id, chat_id, amount).await;
                return Err(WalletError::Backend(err));
            }
        }

        let svc = self.clone();
        let expiring_id = reservation_id.to_string();
        let ttl = self.config.reservation_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            svc.auto_expire(&expiring_id).await;
        });

        tracing::info!(reservation_id, user_id, amount, "reserved chips");
        Ok(ReserveOutcome::Reserved {
            reservation_id: reservation_id.to_string(),
        })
    }

    async fn auto_expire(&self, reservation_id: &str) {
        match self.kv.reservation_get(&reservation_key(reservation_id)).await {
            Ok(Some(reservation)) if reservation.status == ReservationStatus::Pending => {
                tracing::warn!(reservation_id, "auto-expiring reservation");
                if let Err(err) = self.rollback_reservation(reservation_id, "timeout", false).await {
                    tracing::error!(reservation_id, error = %err, "auto-expire rollback failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(reservation_id, error = %err, "failed to load reservation for auto-expire");
            }
        }
    }

    /// Phase 2a: finalizes a pending reservation.
    pub async fn commit_reservation(&self, reservation_id: &str) -> Result<CommitOutcome, WalletError> {
        let start = Instant::now();
        let outcome = self
            .kv
            .reservation_commit(&reservation_key(reservation_id))
            .await?;

        let status_label = match &outcome {
            CommitOutcome::Ok => "success",
            CommitOutcome::Missing => "not_found",
            CommitOutcome::AlreadyCommitted | CommitOutcome::Other(_) => "invalid_status",
        };
        metrics::counter!("poker_wallet_commit_total", "status" => status_label).increment(1);
        metrics::histogram!("poker_wallet_operation_duration_seconds", "operation" => "commit")
            .record(start.elapsed().as_secs_f64());

        match &outcome {
            CommitOutcome::Ok => tracing::info!(reservation_id, "committed reservation"),
            _ => tracing::warn!(reservation_id, outcome = %outcome, "commit did not succeed"),
        }
        Ok(outcome)
    }

    /// Phase 2b: reverses a reservation, crediting the chips back. When
    /// `allow_committed` is set this also compensates an already-committed
    /// reservation (used by the orchestrator's CAS-failure recovery path);
    /// otherwise only a pending reservation can be rolled back. If the
    /// refund credit itself fails, the reservation is pushed to the DLQ for
    /// manual resolution rather than left silently un-refunded.
    pub async fn rollback_reservation(
        &self,
        reservation_id: &str,
        reason: &str,
        allow_committed: bool,
    ) -> Result<RollbackOutcome, WalletError> {
        let start = Instant::now();
        let key = reservation_key(reservation_id);

        let reservation = match self.kv.reservation_get(&key).await? {
            Some(r) => r,
            None => {
                metrics::counter!("poker_wallet_rollback_total", "status" => "not_found").increment(1);
                tracing::warn!(reservation_id, "rollback requested for unknown reservation");
                return Ok(RollbackOutcome::Missing);
            }
        };

        let eligible = reservation.status == ReservationStatus::Pending
            || (allow_committed && reservation.status == ReservationStatus::Committed);
        if !eligible {
            metrics::counter!("poker_wallet_rollback_total", "status" => "invalid_status").increment(1);
            tracing::warn!(
                reservation_id,
                status = reservation.status.as_str(),
                "cannot roll back reservation in this status"
            );
            return Ok(match reservation.status {
                ReservationStatus::Committed => RollbackOutcome::StillCommitted,
                other => RollbackOutcome::Other(other.as_str().to_string()),
            });
        }

        match self
            .ledger
            .credit(reservation.user_id, reservation.chat_id, reservation.amount)
            .await
        {
            Ok(()) => {
                let outcome = self.kv.reservation_rollback(&key, allow_committed, reason).await?;
                metrics::counter!("poker_wallet_rollback_total", "status" => "success").increment(1);
                metrics::histogram!("poker_wallet_operation_duration_seconds", "operation" => "rollback")
                    .record(start.elapsed().as_secs_f64());
                tracing::info!(reservation_id, reason, "rolled back reservation");
                Ok(outcome)
            }
            Err(refund_error) => {
                self.send_to_dlq(&reservation, &refund_error, reason).await;
                metrics::counter!("poker_wallet_dlq_total").increment(1);
                metrics::histogram!("poker_wallet_operation_duration_seconds", "operation" => "rollback")
                    .record(start.elapsed().as_secs_f64());
                tracing::error!(
                    reservation_id,
                    error = %refund_error,
                    "refund failed, reservation sent to dead-letter queue"
                );
                Err(WalletError::RefundFailed {
                    reservation_id: reservation_id.to_string(),
                })
            }
        }
    }

    /// Credits `amount` straight back to the ledger without transitioning
    /// the reservation's terminal status - used by the orchestrator's
    /// state-conflict (CAS failure) recovery, where the reservation is
    /// already `committed` and stays that way (the chips were returned,
    /// but the 2PC record itself is not re-opened). If the credit fails,
    /// this routes to the DLQ exactly like `rollback_reservation` does, so
    /// no credit failure anywhere in this engine goes unrouted.
    pub async fn direct_credit_refund(
        &self,
        reservation_id: &str,
        user_id: i64,
        chat_id: i64,
        amount: u64,
        reason: &str,
    ) -> Result<(), WalletError> {
        let start = Instant::now();
        match self.ledger.credit(user_id, chat_id, amount).await {
            Ok(()) => {
                metrics::counter!("poker_wallet_rollback_total", "status" => "direct_refund").increment(1);
                metrics::histogram!("poker_wallet_operation_duration_seconds", "operation" => "direct_refund")
                    .record(start.elapsed().as_secs_f64());
                tracing::info!(reservation_id, reason, "direct-credited refund for a committed reservation");
                Ok(())
            }
            Err(refund_error) => {
                let synthetic = Reservation {
                    reservation_id: reservation_id.to_string(),
                    user_id,
                    chat_id,
                    amount,
                    created_at: epoch_seconds(),
                    status: ReservationStatus::Committed,
                    metadata: std::collections::HashMap::new(),
                };
                self.send_to_dlq(&synthetic, &refund_error, reason).await;
                metrics::counter!("poker_wallet_dlq_total").increment(1);
                tracing::error!(
                    reservation_id,
                    error = %refund_error,
                    "direct refund failed, reservation sent to dead-letter queue"
                );
                Err(WalletError::RefundFailed {
                    reservation_id: reservation_id.to_string(),
                })
            }
        }
    }

    async fn send_to_dlq(&self, reservation: &Reservation, error: &WalletError, context: &str) {
        let Some(dlq_key) = &self.dlq_key else {
            tracing::error!(
                user_id = reservation.user_id,
                amount = reservation.amount,
                "no DLQ configured - manual refund required"
            );
            return;
        };

        let entry = serde_json::json!({
            "reservation_id": reservation.reservation_id,
            "user_id": reservation.user_id,
            "chat_id": reservation.chat_id,
            "amount": reservation.amount,
            "error": error.to_string(),
            "context": context,
            "timestamp": epoch_seconds(),
        });
        if let Err(err) = self.kv.lpush(dlq_key, &entry.to_string()).await {
            tracing::error!(error = %err, "failed to push refund failure onto dead-letter queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poker_kv::memory::MemoryKvStore;
    use std::collections::HashMap;

    fn wallet() -> WalletService {
        let ledger: Arc<dyn WalletLedger> = Arc::new(InMemoryLedger::with_balance(1, 1, 1000));
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        WalletService::new(ledger, kv, WalletConfig::default())
    }

    #[tokio::test]
    async fn reserve_then_commit_leaves_chips_deducted() {
        let svc = wallet();
        let outcome = svc.reserve_chips(1, 1, 200, HashMap::new()).await.unwrap();
        let reservation_id = match outcome {
            ReserveOutcome::Reserved { reservation_id } => reservation_id,
            other => panic!("expected Reserved, got {other:?}"),
        };
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 800);

        let commit = svc.commit_reservation(&reservation_id).await.unwrap();
        assert_eq!(commit, CommitOutcome::Ok);
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn reserve_then_rollback_refunds_chips() {
        let svc = wallet();
        let outcome = svc.reserve_chips(1, 1, 200, HashMap::new()).await.unwrap();
        let reservation_id = match outcome {
            ReserveOutcome::Reserved { reservation_id } => reservation_id,
            other => panic!("expected Reserved, got {other:?}"),
        };
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 800);

        let rollback = svc
            .rollback_reservation(&reservation_id, "explicit_rollback", false)
            .await
            .unwrap();
        assert_eq!(rollback, RollbackOutcome::RolledBack);
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn reserving_more_than_the_balance_is_refused_without_touching_chips() {
        let svc = wallet();
        let outcome = svc.reserve_chips(1, 1, 5000, HashMap::new()).await.unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::InsufficientFunds {
                needed: 5000,
                available: 1000
            }
        );
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn rollback_after_commit_is_refused_without_allow_committed() {
        let svc = wallet();
        let outcome = svc.reserve_chips(1, 1, 200, HashMap::new()).await.unwrap();
        let reservation_id = match outcome {
            ReserveOutcome::Reserved { reservation_id } => reservation_id,
            other => panic!("expected Reserved, got {other:?}"),
        };
        svc.commit_reservation(&reservation_id).await.unwrap();

        let rollback = svc
            .rollback_reservation(&reservation_id, "cas_conflict", false)
            .await
            .unwrap();
        assert_eq!(rollback, RollbackOutcome::StillCommitted);
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn rollback_after_commit_with_allow_committed_compensates() {
        let svc = wallet();
        let outcome = svc.reserve_chips(1, 1, 200, HashMap::new()).await.unwrap();
        let reservation_id = match outcome {
            ReserveOutcome::Reserved { reservation_id } => reservation_id,
            other => panic!("expected Reserved, got {other:?}"),
        };
        svc.commit_reservation(&reservation_id).await.unwrap();

        let rollback = svc
            .rollback_reservation(&reservation_id, "cas_conflict", true)
            .await
            .unwrap();
        assert_eq!(rollback, RollbackOutcome::Compensated);
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn rollback_of_unknown_reservation_reports_missing() {
        let svc = wallet();
        let rollback = svc
            .rollback_reservation("res_404_404_0", "explicit_rollback", false)
            .await
            .unwrap();
        assert_eq!(rollback, RollbackOutcome::Missing);
    }

    #[tokio::test]
    async fn direct_credit_refund_leaves_chips_whole_without_touching_reservation_status() {
        let svc = wallet();
        let outcome = svc.reserve_chips(1, 1, 200, HashMap::new()).await.unwrap();
        let reservation_id = match outcome {
            ReserveOutcome::Reserved { reservation_id } => reservation_id,
            other => panic!("expected Reserved, got {other:?}"),
        };
        svc.commit_reservation(&reservation_id).await.unwrap();
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 800);

        svc.direct_credit_refund(&reservation_id, 1, 1, 200, "state_conflict")
            .await
            .unwrap();
        assert_eq!(svc.ledger.balance(1, 1).await.unwrap(), 1000);

        let stored = svc
            .kv
            .reservation_get(&reservation_key(&reservation_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ReservationStatus::Committed);
    }

    struct FailingCreditLedger;

    #[async_trait::async_trait]
    impl WalletLedger for FailingCreditLedger {
        async fn balance(&self, _user_id: i64, _chat_id: i64) -> Result<u64, WalletError> {
            Ok(1000)
        }

        async fn deduct(&self, _user_id: i64, _chat_id: i64, _amount: u64) -> Result<(), WalletError> {
            Ok(())
        }

        async fn credit(&self, _user_id: i64, _chat_id: i64, _amount: u64) -> Result<(), WalletError> {
            Err(WalletError::Backend(KvError::Backend("credit backend down".to_string())))
        }
    }

    #[tokio::test]
    async fn direct_credit_refund_failure_routes_to_dlq() {
        let ledger: Arc<dyn WalletLedger> = Arc::new(FailingCreditLedger);
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let svc = WalletService::new(ledger, kv.clone(), WalletConfig::default());

        let err = svc
            .direct_credit_refund("res_1_1_123", 1, 1, 200, "state_conflict")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::RefundFailed { .. }));
        assert_eq!(kv.llen("poker:wallet:dlq").await.unwrap(), 1);
    }
}
