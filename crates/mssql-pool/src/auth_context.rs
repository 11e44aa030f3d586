//! Cross-connection authentication context cache.
//!
//! Federated logins acquire an access token for an `(authority, resource)`
//! pair. Connections of the same pool group share those tokens through this
//! cache instead of acquiring a new one per login.

use std::collections::HashMap;

use mssql_auth::AccessToken;
use parking_lot::RwLock;

/// Cache key: the token authority and the resource it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthContextKey {
    /// Token authority (STS URL).
    pub authority: String,
    /// Resource (server SPN).
    pub resource: String,
}

impl AuthContextKey {
    /// Create a key.
    pub fn new(authority: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            resource: resource.into(),
        }
    }
}

/// Shared cache of authentication contexts.
#[derive(Debug, Default)]
pub struct AuthContextCache {
    entries: RwLock<HashMap<AuthContextKey, AccessToken>>,
}

impl AuthContextCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// An unexpired token for the key.
    pub fn get(&self, key: &AuthContextKey) -> Option<AccessToken> {
        self.entries
            .read()
            .get(key)
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Insert a token, keeping whichever of the new and the existing token
    /// expires later. Returns the token now stored.
    pub fn merge(&self, key: AuthContextKey, token: AccessToken) -> AccessToken {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(existing) if existing.expires_on >= token.expires_on => {
                tracing::trace!(authority = %key.authority, "keeping cached authentication context");
                existing.clone()
            }
            _ => {
                tracing::debug!(authority = %key.authority, resource = %key.resource, "caching authentication context");
                entries.insert(key, token.clone());
                token
            }
        }
    }

    /// Remove the token for a key.
    pub fn remove(&self, key: &AuthContextKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
