// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared data model for the poker betting transactional core: reservations,
//! the ledger row key, the opaque-but-contracted game state document, and
//! the result type the orchestrator always returns to its caller.

pub mod action;
pub mod game_state;
pub mod reservation;
pub mod result;

pub use action::BettingAction;
pub use game_state::{GameState, PlayerState};
pub use reservation::{make_reservation_id, Reservation, ReservationStatus};
pub use result::BettingResult;

/// Identifies a player within a chat-scoped table.
pub type UserId = i64;
/// Identifies a chat (table) the game is running in.
pub type ChatId = i64;
/// Chip amounts are small non-negative integers; no currency has sub-unit
/// precision in this system.
pub type Chips = u64;

/// Returns the current epoch time in whole seconds.
pub fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current epoch time in whole milliseconds.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
