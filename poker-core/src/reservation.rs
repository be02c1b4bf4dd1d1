use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ChatId, Chips, UserId};

/// Lifecycle state of a chip reservation.
///
/// The lowercase serialized form (`"pending"`, `"committed"`, …) is part of
/// the durable-store wire contract: the KV scripts in `poker-kv` compare
/// against these exact strings, so renaming a variant is a compatibility
/// break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Committed,
    RolledBack,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Committed => "committed",
            ReservationStatus::RolledBack => "rolled_back",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of a pending (or terminalized) chip movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub amount: Chips,
    pub created_at: i64,
    pub status: ReservationStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Reservation {
    pub fn new(
        reservation_id: String,
        user_id: UserId,
        chat_id: ChatId,
        amount: Chips,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            reservation_id,
            user_id,
            chat_id,
            amount,
            created_at: crate::epoch_seconds(),
            status: ReservationStatus::Pending,
            metadata,
        }
    }
}

/// Builds the reservation id in the `res_{user}_{chat}_{epoch_ms}` format.
///
/// This format is part of the external contract: debug logs and dead-letter
/// queue entries carry it verbatim, so its shape must not change.
pub fn make_reservation_id(user_id: UserId, chat_id: ChatId, epoch_millis: i64) -> String {
    format!("res_{user_id}_{chat_id}_{epoch_millis}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_id_matches_external_contract_shape() {
        let id = make_reservation_id(42, 99, 1_700_000_000_123);
        assert_eq!(id, "res_42_99_1700000000123");
    }

    #[test]
    fn status_serializes_to_exact_wire_strings() {
        assert_eq!(
            serde_json::to_string(&ReservationStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(ReservationStatus::Committed.as_str(), "committed");
    }
}
