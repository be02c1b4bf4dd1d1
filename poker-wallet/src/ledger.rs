use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::WalletError;

/// The chip balance store a `WalletService` debits and credits. Grounded on
/// `wallet_service.py::_get_user_balance` / `_deduct_from_wallet` /
/// `_credit_to_wallet`, which take a `SELECT ... FOR UPDATE` row lock per
/// `(user_id, chat_id)`; implementors must give the same per-row atomicity.
#[async_trait]
pub trait WalletLedger: Send + Sync {
    async fn balance(&self, user_id: i64, chat_id: i64) -> Result<u64, WalletError>;

    /// Deducts `amount`, failing with `InsufficientFunds` if the row holds
    /// less, atomically with respect to other calls on the same row.
    async fn deduct(&self, user_id: i64, chat_id: i64, amount: u64) -> Result<(), WalletError>;

    /// Credits `amount` to the row, creating it at that balance if absent.
    async fn credit(&self, user_id: i64, chat_id: i64, amount: u64) -> Result<(), WalletError>;
}

/// A row-locked in-memory ledger. Stands in for the real ORM-backed player
/// table in tests and in deployments that front a different store.
pub struct InMemoryLedger {
    rows: tokio::sync::Mutex<HashMap<(i64, i64), u64>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            rows: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_balance(user_id: i64, chat_id: i64, chips: u64) -> Self {
        let mut rows = HashMap::new();
        rows.insert((user_id, chat_id), chips);
        Self {
            rows: tokio::sync::Mutex::new(rows),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletLedger for InMemoryLedger {
    async fn balance(&self, user_id: i64, chat_id: i64) -> Result<u64, WalletError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&(user_id, chat_id)).copied().unwrap_or(0))
    }

    async fn deduct(&self, user_id: i64, chat_id: i64, amount: u64) -> Result<(), WalletError> {
        let mut rows = self.rows.lock().await;
        let entry = rows.entry((user_id, chat_id)).or_insert(0);
        if *entry < amount {
            return Err(WalletError::InsufficientFunds {
                needed: amount,
                have: *entry,
            });
        }
        *entry -= amount;
        Ok(())
    }

    async fn credit(&self, user_id: i64, chat_id: i64, amount: u64) -> Result<(), WalletError> {
        let mut rows = self.rows.lock().await;
        let entry = rows.entry((user_id, chat_id)).or_insert(0);
        *entry += amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduct_refuses_to_go_negative() {
        let ledger = InMemoryLedger::with_balance(1, 1, 50);
        let err = ledger.deduct(1, 1, 100).await.unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { needed: 100, have: 50 }));
        assert_eq!(ledger.balance(1, 1).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn credit_creates_an_absent_row() {
        let ledger = InMemoryLedger::new();
        ledger.credit(2, 1, 30).await.unwrap();
        assert_eq!(ledger.balance(2, 1).await.unwrap(), 30);
    }
}
