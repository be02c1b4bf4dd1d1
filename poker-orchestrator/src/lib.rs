// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end atomic handling of a single betting action. This is the only
//! component that composes the wallet, lock, and state-store engines -
//! every other crate in the workspace stands alone. Grounded on
//! `betting_handler.py::BettingHandler.handle_betting_action`.

mod transition;
mod validate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use poker_core::{BettingAction, BettingResult, ChatId, Chips, GameState, UserId};
use poker_kv::CommitOutcome;
use poker_lock::{LockError, LockOwner, LockService};
use poker_state::StateStore;
use poker_wallet::{ReserveOutcome, WalletService};

pub use transition::{DefaultTransition, GameTransition};

/// Tunables for one orchestrator instance. `table_lock_timeout` mirrors the
/// 30s default a betting action uses for its table write lock (`spec.md`
/// §5 Timeouts).
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub table_lock_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            table_lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Composes the 2PC wallet, the hierarchical lock service, and the
/// versioned state store into one atomic `handle` operation. Cheap to
/// clone: every field is an `Arc` or a `Copy` config.
#[derive(Clone)]
pub struct BettingOrchestrator {
    wallet: WalletService,
    locks: Arc<LockService>,
    state_store: Arc<dyn StateStore>,
    transition: Arc<dyn GameTransition>,
    config: OrchestratorConfig,
}

impl BettingOrchestrator {
    pub fn new(
        wallet: WalletService,
        locks: Arc<LockService>,
        state_store: Arc<dyn StateStore>,
        transition: Arc<dyn GameTransition>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            wallet,
            locks,
            state_store,
            transition,
            config,
        }
    }

    /// Handles one player action end to end. Never raises to its caller:
    /// every exit point, including genuinely unexpected backend errors, is
    /// folded into a `BettingResult`.
    pub async fn handle(
        &self,
        owner: LockOwner,
        user_id: UserId,
        chat_id: ChatId,
        action: BettingAction,
        amount: Option<Chips>,
    ) -> BettingResult {
        let start = Instant::now();
        let result = self.handle_inner(owner, user_id, chat_id, &action, amount).await;
        metrics::histogram!("poker_orchestrator_action_duration_seconds", "action" => action.as_str().to_string())
            .record(start.elapsed().as_secs_f64());
        metrics::counter!("poker_orchestrator_action_total", "status" => if result.success { "success" } else { "failure" })
            .increment(1);
        result
    }

    async fn handle_inner(
        &self,
        owner: LockOwner,
        user_id: UserId,
        chat_id: ChatId,
        action: &BettingAction,
        amount: Option<Chips>,
    ) -> BettingResult {
        // Phase 1 - validate outside any lock.
        let state = match self.state_store.load_with_version(chat_id).await {
            Ok(Some((state, _version))) => state,
            Ok(None) => return BettingResult::failure("No active game"),
            Err(err) => {
                tracing::error!(chat_id, error = %err, "failed to load game state for validation");
                return BettingResult::failure("Internal error - please try again");
            }
        };
        let required_amount = match validate::validate(&state, user_id, action, amount) {
            Ok(amount) => amount,
            Err(message) => return BettingResult::failure(message),
        };

        // Phase 2 - reserve, if this action moves chips.
        let reservation_id = if required_amount > 0 {
            let metadata = HashMap::from([
                ("action".to_string(), action.as_str().to_string()),
                ("stage".to_string(), state.stage.clone()),
            ]);
            match self.wallet.reserve_chips(user_id, chat_id, required_amount, metadata).await {
                Ok(ReserveOutcome::Reserved { reservation_id }) => Some(reservation_id),
                Ok(ReserveOutcome::InsufficientFunds { needed, available }) => {
                    return BettingResult::failure(format!("Insufficient chips: need {needed}, have {available}"));
                }
                Err(err) => {
                    tracing::error!(chat_id, user_id, error = %err, "wallet reservation failed");
                    return BettingResult::failure("Wallet error - action rejected");
                }
            }
        } else {
            None
        };

        let mut guard =
            reservation_id
                .clone()
                .map(|reservation_id| CompensationGuard::new(self.wallet.clone(), reservation_id, user_id, chat_id, required_amount));

        // Phase 3 - acquire the table write lock.
        let lock_guard = match self.locks.table_write_lock(chat_id, owner, self.config.table_lock_timeout).await {
            Ok(guard) => guard,
            Err(err) => {
                if let Some(reservation_id) = &reservation_id {
                    let _ = self.wallet.rollback_reservation(reservation_id, "lock_timeout", false).await;
                }
                disarm(&mut guard);
                return BettingResult::failure(lock_failure_message(&err));
            }
        };

        // Phase 4 - re-read state under the lock; this is the version CAS
        // save relies on in phase 7.
        let (fresh_state, expected_version) = match self.state_store.load_with_version(chat_id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                if let Some(reservation_id) = &reservation_id {
                    let _ = self.wallet.rollback_reservation(reservation_id, "game_not_found", false).await;
                }
                disarm(&mut guard);
                drop(lock_guard);
                return BettingResult::failure("Game not found or ended");
            }
            Err(err) => {
                tracing::error!(chat_id, error = %err, "failed to re-read game state under lock");
                if let Some(reservation_id) = &reservation_id {
                    let _ = self.wallet.rollback_reservation(reservation_id, "state_load_error", false).await;
                }
                disarm(&mut guard);
                drop(lock_guard);
                return BettingResult::failure("Internal error - action cancelled, funds returned");
            }
        };
        if let Some(expected_turn) = fresh_state.current_player_id {
            if expected_turn != user_id {
                if let Some(reservation_id) = &reservation_id {
                    let _ = self.wallet.rollback_reservation(reservation_id, "not_players_turn", false).await;
                }
                disarm(&mut guard);
                drop(lock_guard);
                return BettingResult::failure("Not your turn");
            }
        }

        // Phase 5 - commit the reservation.
        if let Some(reservation_id) = &reservation_id {
            match self.wallet.commit_reservation(reservation_id).await {
                Ok(CommitOutcome::Ok) | Ok(CommitOutcome::AlreadyCommitted) => {}
                Ok(other) => {
                    disarm(&mut guard);
                    drop(lock_guard);
                    return BettingResult::failure(format!("Failed to commit bet: {other}"));
                }
                Err(err) => {
                    tracing::error!(chat_id, user_id, error = %err, "reservation commit failed");
                    disarm(&mut guard);
                    drop(lock_guard);
                    return BettingResult::failure("Failed to commit bet");
                }
            }
        }
        mark_committed(&mut guard);

        // Phase 6 - apply the pure transition.
        let mut new_state = self.transition.apply(&fresh_state, user_id, action, required_amount);
        new_state.version = expected_version + 1;

        // Phase 7 - CAS save.
        match self.state_store.save_with_version(chat_id, &new_state, expected_version).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(chat_id, expected_version, "version conflict detected, triggering refund");
                let outcome = self.refund_committed(&reservation_id, user_id, chat_id, required_amount).await;
                disarm(&mut guard);
                drop(lock_guard);
                return match outcome {
                    Ok(()) => BettingResult::failure("State conflict - action cancelled, funds returned"),
                    Err(()) => BettingResult::failure(
                        "State conflict - action cancelled, refund failed - queued for manual resolution",
                    ),
                };
            }
            Err(err) => {
                tracing::error!(chat_id, error = %err, "game state save failed");
                let _ = self.refund_committed(&reservation_id, user_id, chat_id, required_amount).await;
                disarm(&mut guard);
                drop(lock_guard);
                return BettingResult::failure("Internal error - action cancelled, funds returned");
            }
        }

        // Phase 8 - success.
        disarm(&mut guard);
        drop(lock_guard);
        tracing::info!(chat_id, user_id, action = action.as_str(), required_amount, "betting action successful");
        BettingResult::success(format!("{action} successful"), new_state, reservation_id)
    }

    /// Credits a committed reservation's chips straight back without
    /// reopening its 2PC record (used by phases 7's conflict branches).
    /// A no-op, reporting success, when no chips were ever reserved.
    async fn refund_committed(
        &self,
        reservation_id: &Option<String>,
        user_id: UserId,
        chat_id: ChatId,
        amount: Chips,
    ) -> Result<(), ()> {
        let Some(reservation_id) = reservation_id else {
            return Ok(());
        };
        self.wallet
            .direct_credit_refund(reservation_id, user_id, chat_id, amount, "state_conflict")
            .await
            .map_err(|_| ())
    }
}

fn lock_failure_message(err: &LockError) -> String {
    match err {
        LockError::Timeout { .. } => "Table is busy - action cancelled, funds returned".to_string(),
        other => {
            tracing::error!(error = %other, "unexpected lock error acquiring table write lock");
            "Internal error - action cancelled, funds returned".to_string()
        }
    }
}

fn disarm(guard: &mut Option<CompensationGuard>) {
    if let Some(guard) = guard.as_mut() {
        guard.disarm();
    }
}

fn mark_committed(guard: &mut Option<CompensationGuard>) {
    if let Some(guard) = guard.as_mut() {
        guard.mark_committed();
    }
}

/// Scope-guarded cleanup for a reservation in flight. If `handle` is
/// cancelled (its future dropped) before the normal control flow disarms
/// this guard, `Drop` spawns the stage-appropriate compensation - rollback
/// if the reservation never committed, direct refund if it did. Mirrors the
/// `try/finally` compensation block in the original handler, expressed as
/// Rust's RAII-plus-spawn idiom (the same pattern `WalletService::reserve_chips`
/// uses for its auto-expire task).
struct CompensationGuard {
    wallet: WalletService,
    reservation_id: String,
    user_id: UserId,
    chat_id: ChatId,
    amount: Chips,
    committed: bool,
    armed: bool,
}

impl CompensationGuard {
    fn new(wallet: WalletService, reservation_id: String, user_id: UserId, chat_id: ChatId, amount: Chips) -> Self {
        Self {
            wallet,
            reservation_id,
            user_id,
            chat_id,
            amount,
            committed: false,
            armed: true,
        }
    }

    fn mark_committed(&mut self) {
        self.committed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CompensationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let wallet = self.wallet.clone();
        let reservation_id = std::mem::take(&mut self.reservation_id);
        let user_id = self.user_id;
        let chat_id = self.chat_id;
        let amount = self.amount;
        let committed = self.committed;
        tracing::warn!(reservation_id, committed, "betting action dropped before completion, compensating");
        tokio::spawn(async move {
            let result = if committed {
                wallet
                    .direct_credit_refund(&reservation_id, user_id, chat_id, amount, "cancelled")
                    .await
                    .map(|_| ())
            } else {
                wallet
                    .rollback_reservation(&reservation_id, "cancelled", false)
                    .await
                    .map(|_| ())
            };
            if let Err(err) = result {
                tracing::error!(reservation_id, error = %err, "compensation for a dropped betting action failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poker_core::PlayerState;
    use poker_kv::memory::MemoryKvStore;
    use poker_state::{KvStateStore, StateStoreConfig, StateStoreError};
    use poker_wallet::{InMemoryLedger, WalletConfig, WalletLedger};
    use std::sync::Arc;

    /// Forces exactly one concurrent-writer-style version bump on the next
    /// `save_with_version` call, so the orchestrator's own save loses the
    /// CAS race at phase 7 - reproducing scenario 3 without any internal
    /// hook beyond the real store's CAS contract.
    struct ConflictInjectingStore {
        inner: Arc<dyn StateStore>,
        inject_once: tokio::sync::Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl StateStore for ConflictInjectingStore {
        async fn load_with_version(&self, chat_id: ChatId) -> Result<Option<(GameState, u64)>, StateStoreError> {
            self.inner.load_with_version(chat_id).await
        }

        async fn save_with_version(
            &self,
            chat_id: ChatId,
            state: &GameState,
            expected_version: u64,
        ) -> Result<bool, StateStoreError> {
            let mut inject_once = self.inject_once.lock().await;
            if *inject_once {
                *inject_once = false;
                if let Some((current, version)) = self.inner.load_with_version(chat_id).await? {
                    self.inner.save_with_version(chat_id, &current, version).await?;
                }
            }
            drop(inject_once);
            self.inner.save_with_version(chat_id, state, expected_version).await
        }
    }

    fn seed_state() -> GameState {
        GameState {
            version: 1,
            players: vec![PlayerState {
                user_id: 1,
                chips: 1000,
                current_bet: 0,
                folded: false,
            }],
            current_bet: 100,
            current_player_id: Some(1),
            stage: "preflop".to_string(),
            pot: 0,
            extra: serde_json::Map::new(),
        }
    }

    async fn build(balance: u64) -> (BettingOrchestrator, Arc<dyn StateStore>, Arc<dyn WalletLedger>) {
        let kv = Arc::new(MemoryKvStore::new());
        let ledger: Arc<dyn WalletLedger> = Arc::new(InMemoryLedger::with_balance(1, 99, balance));
        let wallet = WalletService::new(ledger.clone(), kv.clone(), WalletConfig::default());
        let locks = Arc::new(LockService::default());
        let state_store: Arc<dyn StateStore> = Arc::new(KvStateStore::new(kv.clone(), StateStoreConfig::default()));
        state_store.save_with_version(99, &seed_state(), 0).await.unwrap();

        let orchestrator = BettingOrchestrator::new(
            wallet,
            locks,
            state_store.clone(),
            Arc::new(DefaultTransition),
            OrchestratorConfig::default(),
        );
        (orchestrator, state_store, ledger)
    }

    #[tokio::test]
    async fn happy_path_call_debits_the_ledger_and_advances_the_pot() {
        let (orchestrator, _state_store, ledger) = build(1000).await;
        let result = orchestrator.handle(1, 1, 99, BettingAction::Call, None).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(ledger.balance(1, 99).await.unwrap(), 900);
        let new_state = result.new_state.unwrap();
        assert_eq!(new_state.version, 2);
        assert_eq!(new_state.pot, 100);
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_the_ledger_untouched() {
        let (orchestrator, _state_store, ledger) = build(50).await;
        let result = orchestrator.handle(1, 1, 99, BettingAction::Call, None).await;

        assert!(!result.success);
        assert!(result.message.to_lowercase().contains("insufficient"));
        assert_eq!(ledger.balance(1, 99).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn cas_conflict_refunds_and_keeps_the_reservation_committed() {
        let kv = Arc::new(MemoryKvStore::new());
        let ledger: Arc<dyn WalletLedger> = Arc::new(InMemoryLedger::with_balance(1, 99, 1000));
        let wallet = WalletService::new(ledger.clone(), kv.clone(), WalletConfig::default());
        let locks = Arc::new(LockService::default());
        let real_store: Arc<dyn StateStore> = Arc::new(KvStateStore::new(kv.clone(), StateStoreConfig::default()));
        real_store.save_with_version(99, &seed_state(), 0).await.unwrap();
        let state_store: Arc<dyn StateStore> = Arc::new(ConflictInjectingStore {
            inner: real_store,
            inject_once: tokio::sync::Mutex::new(true),
        });

        let orchestrator = BettingOrchestrator::new(
            wallet,
            locks,
            state_store,
            Arc::new(DefaultTransition),
            OrchestratorConfig::default(),
        );

        let result = orchestrator.handle(1, 1, 99, BettingAction::Call, None).await;

        assert!(!result.success);
        assert!(result.message.to_lowercase().contains("conflict"));
        assert_eq!(ledger.balance(1, 99).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn not_your_turn_is_rejected_after_acquiring_the_lock() {
        let (orchestrator, state_store, ledger) = build(1000).await;
        let mut other_turn = seed_state();
        other_turn.current_player_id = Some(2);
        state_store.save_with_version(99, &other_turn, 1).await.unwrap();

        let result = orchestrator.handle(1, 1, 99, BettingAction::Call, None).await;

        assert!(!result.success);
        assert_eq!(result.message, "Not your turn");
        assert_eq!(ledger.balance(1, 99).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_before_any_reservation() {
        let (orchestrator, _state_store, ledger) = build(1000).await;
        let result = orchestrator
            .handle(1, 1, 99, BettingAction::Unknown("surrender".to_string()), None)
            .await;

        assert!(!result.success);
        assert_eq!(result.message, "Unknown action: surrender");
        assert_eq!(ledger.balance(1, 99).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn fold_requires_no_reservation_and_marks_the_player_folded() {
        let (orchestrator, _state_store, ledger) = build(1000).await;
        let result = orchestrator.handle(1, 1, 99, BettingAction::Fold, None).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(ledger.balance(1, 99).await.unwrap(), 1000);
        assert!(result.new_state.unwrap().player(1).unwrap().folded);
    }
}
