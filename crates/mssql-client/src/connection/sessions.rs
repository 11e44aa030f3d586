//! Session handles leased to executing commands.
//!
//! A [`SessionLease`] owns its session until it is dropped, which returns the
//! session to the pool. Ownership makes a double return impossible and the
//! drop makes a leak impossible; the counters let tests check both.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::transport::{PhysicalConnection, Session};

/// Acquire/return counters of a session pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions handed out.
    pub acquired: u64,
    /// Sessions given back.
    pub returned: u64,
    /// Sessions idle in the pool.
    pub idle: usize,
}

impl SessionStats {
    /// Sessions currently leased.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.returned
    }
}

struct PoolInner {
    idle: Mutex<Vec<Box<dyn Session>>>,
    generation: AtomicU64,
    acquired: AtomicU64,
    returned: AtomicU64,
}

/// Idle sessions of the current physical connection.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
        }
    }

    /// Forget idle sessions; sessions leased before this are discarded on return.
    pub fn advance_generation(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.idle.lock().clear();
    }

    /// Lease a session, reusing an idle one when possible.
    pub fn acquire(&self, physical: &Arc<dyn PhysicalConnection>) -> Result<SessionLease> {
        let generation = self.inner.generation.load(Ordering::Acquire);
        let session = match self.inner.idle.lock().pop() {
            Some(session) => session,
            None => physical.open_session()?,
        };
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(SessionLease {
            session: Some(session),
            generation,
            in_flight: false,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Current counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            acquired: self.inner.acquired.load(Ordering::Acquire),
            returned: self.inner.returned.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A leased session. Returned to its pool exactly once, on drop.
pub struct SessionLease {
    session: Option<Box<dyn Session>>,
    generation: u64,
    in_flight: bool,
    pool: Arc<PoolInner>,
}

impl SessionLease {
    /// The leased session.
    pub fn session(&mut self) -> Result<&mut (dyn Session + 'static)> {
        self.session.as_deref_mut().ok_or(Error::ConnectionClosed)
    }

    /// Mark a request as sent but not fully read. A lease dropped in this
    /// state discards its session instead of pooling it.
    pub fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }

    /// Return the session now.
    pub fn release(self) {}
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.pool.returned.fetch_add(1, Ordering::AcqRel);
        let current = self.pool.generation.load(Ordering::Acquire);
        if !self.in_flight && self.generation == current {
            self.pool.idle.lock().push(session);
        } else {
            tracing::trace!(in_flight = self.in_flight, "discarding returned session");
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("generation", &self.generation)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
