use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::LockOwner;

struct State {
    owner: Option<LockOwner>,
    depth: u32,
    guard: Option<OwnedMutexGuard<()>>,
}

/// A task-aware re-entrant async mutex. An owner that already holds the
/// lock increments a depth counter instead of blocking; the underlying
/// mutex is released only when depth returns to zero.
pub struct ReentrantLock {
    mutex: Arc<AsyncMutex<()>>,
    state: StdMutex<State>,
}

pub enum FastAcquire {
    Reentered,
    Acquired,
    WouldBlock,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self {
            mutex: Arc::new(AsyncMutex::new(())),
            state: StdMutex::new(State {
                owner: None,
                depth: 0,
                guard: None,
            }),
        }
    }
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to acquire without ever suspending: either the owner
    /// already holds it (re-entered), the uncontended mutex was taken
    /// (acquired), or it is currently held by someone else (would block).
    pub fn try_acquire(&self, owner: LockOwner) -> FastAcquire {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.owner == Some(owner) && state.depth > 0 {
            state.depth += 1;
            return FastAcquire::Reentered;
        }
        match Arc::clone(&self.mutex).try_lock_owned() {
            Ok(guard) => {
                state.owner = Some(owner);
                state.depth = 1;
                state.guard = Some(guard);
                FastAcquire::Acquired
            }
            Err(_) => FastAcquire::WouldBlock,
        }
    }

    /// Acquires, suspending until the underlying mutex is available if
    /// necessary. Re-entrant for an owner that already holds it.
    pub async fn acquire(&self, owner: LockOwner) {
        {
            let mut state = self.state.lock().expect("lock state poisoned");
            if state.owner == Some(owner) && state.depth > 0 {
                state.depth += 1;
                return;
            }
        }
        let guard = Arc::clone(&self.mutex).lock_owned().await;
        let mut state = self.state.lock().expect("lock state poisoned");
        state.owner = Some(owner);
        state.depth = 1;
        state.guard = Some(guard);
    }

    /// Releases one level of re-entrancy. A release by a task that is not
    /// the recorded owner is logged and honored anyway - callbacks
    /// scheduled outside the owning task legitimately release locks, and
    /// refusing would leak them. Depth accounting is never corrupted: a
    /// release with depth already at zero is a no-op.
    pub fn release(&self, owner: LockOwner) {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.depth == 0 {
            return;
        }
        if state.owner != Some(owner) {
            tracing::warn!(
                owner,
                recorded_owner = ?state.owner,
                "non-owner release of re-entrant lock; releasing anyway"
            );
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            state.guard = None;
        }
    }

    pub fn depth(&self) -> u32 {
        self.state.lock().expect("lock state poisoned").depth
    }
}
