// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hierarchical re-entrant locking with deadlock prevention, timed
//! acquisition, distributed-contention-aware smart retry, and per-chat
//! action tokens. Grounded on `lock_manager.py` and `utils/locks.py`.

pub mod action;
mod error;
mod hierarchy;
mod reentrant;
pub mod service;
pub mod smart_retry;

pub use action::{
    acquire_action_lock, acquire_action_lock_with_progress, estimate_queue_position,
    ActionLockGuard,
};
pub use error::{LockError, LockOwner};
pub use hierarchy::LockKind;
pub use service::{LockConfig, LockGuard, LockService};
pub use smart_retry::{acquire_with_smart_retry, SmartRetryConfig};
