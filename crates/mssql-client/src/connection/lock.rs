//! The connection lock.
//!
//! Every write to the wire and every teardown of the physical connection
//! happens under this lock. Holding it is represented by a [`LockToken`];
//! functions that may close the connection take `Option<&LockToken>` and only
//! acquire the lock themselves when the caller does not already hold it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// An async mutex serializing wire writes and teardown.
#[derive(Debug)]
pub struct ConnectionLock {
    id: u64,
    mutex: Arc<Mutex<()>>,
}

impl ConnectionLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            mutex: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for the lock.
    pub async fn acquire(&self) -> LockToken {
        LockToken {
            lock_id: self.id,
            _guard: Arc::clone(&self.mutex).lock_owned().await,
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> Option<LockToken> {
        Arc::clone(&self.mutex)
            .try_lock_owned()
            .ok()
            .map(|guard| LockToken {
                lock_id: self.id,
                _guard: guard,
            })
    }

    /// Whether `token` proves this lock is held.
    #[must_use]
    pub fn is_held_by(&self, token: &LockToken) -> bool {
        token.lock_id == self.id
    }
}

impl Default for ConnectionLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the caller holds a [`ConnectionLock`]. Released on drop.
#[derive(Debug)]
pub struct LockToken {
    lock_id: u64,
    _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_excludes_other_holders() {
        let lock = ConnectionLock::new();
        let token = lock.acquire().await;
        assert!(lock.is_held_by(&token));
        assert!(lock.try_acquire().is_none());
        drop(token);
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_token_is_bound_to_its_lock() {
        let a = ConnectionLock::new();
        let b = ConnectionLock::new();
        let token = a.acquire().await;
        assert!(!b.is_held_by(&token));
    }
}
