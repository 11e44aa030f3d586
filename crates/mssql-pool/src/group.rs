//! Pool group bookkeeping shared by connections with the same settings.
//!
//! The group remembers which side of a mirrored pair last accepted a login,
//! the failover partner the server last reported, and the authentication
//! contexts its connections obtained.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::auth_context::AuthContextCache;
use crate::error::PoolError;

/// Failover state of a pool group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolGroupInfo {
    /// The last successful login went to the failover partner.
    pub use_failover_partner: bool,
    /// Failover partner reported by the server, if any.
    pub failover_partner: Option<String>,
}

/// State shared by every connection opened with the same settings.
#[derive(Debug, Default)]
pub struct PoolGroup {
    info: Mutex<PoolGroupInfo>,
    auth_contexts: AuthContextCache,
    closed: AtomicBool,
}

impl PoolGroup {
    /// Create a group with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the failover state.
    pub fn info(&self) -> PoolGroupInfo {
        self.info.lock().clone()
    }

    /// Whether the next login should start with the failover partner.
    pub fn use_failover_partner(&self) -> bool {
        self.info.lock().use_failover_partner
    }

    /// Record which side of the pair accepted the last login.
    pub fn failover_check(&self, use_failover_partner: bool) {
        let mut info = self.info.lock();
        if info.use_failover_partner != use_failover_partner {
            tracing::info!(use_failover_partner, "pool group switched failover side");
        }
        info.use_failover_partner = use_failover_partner;
    }

    /// Failover partner last reported by the server.
    pub fn failover_partner(&self) -> Option<String> {
        self.info.lock().failover_partner.clone()
    }

    /// Remember the failover partner the server reported.
    pub fn set_failover_partner(&self, partner: Option<String>) {
        self.info.lock().failover_partner = partner.filter(|p| !p.is_empty());
    }

    /// Authentication contexts shared by the group.
    pub fn auth_contexts(&self) -> &AuthContextCache {
        &self.auth_contexts
    }

    /// Refuse new connections from now on.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        tracing::info!("pool group closed");
    }

    /// Fail if the group has been shut down.
    pub fn ensure_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PoolError::PoolClosed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_check_records_side() {
        let group = PoolGroup::new();
        assert!(!group.use_failover_partner());
        group.failover_check(true);
        assert!(group.use_failover_partner());
        group.failover_check(false);
        assert!(!group.info().use_failover_partner);
    }

    #[test]
    fn test_shutdown() {
        let group = PoolGroup::new();
        assert!(group.ensure_open().is_ok());
        group.shutdown();
        assert_eq!(group.ensure_open(), Err(PoolError::PoolClosed));
    }

    #[test]
    fn test_failover_partner_ignores_empty() {
        let group = PoolGroup::new();
        group.set_failover_partner(Some("mirror".into()));
        assert_eq!(group.failover_partner().as_deref(), Some("mirror"));
        group.set_failover_partner(Some(String::new()));
        assert_eq!(group.failover_partner(), None);
    }
}
