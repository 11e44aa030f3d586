//! Federated token providers.
//!
//! Federated logins need an access token for the authority and resource the
//! server names. A [`TokenProvider`] issues those tokens; the connection pool
//! caches them per `(authority, resource)` so sibling connections reuse them
//! until they expire.

use std::time::{Duration, SystemTime};

use crate::error::AuthError;

/// An issued access token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Token string sent in the login.
    pub token: String,
    /// When the token stops being valid.
    pub expires_on: SystemTime,
}

impl AccessToken {
    /// Create a token expiring at `expires_on`.
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// Create a token valid for `ttl` from now.
    pub fn valid_for(token: impl Into<String>, ttl: Duration) -> Self {
        Self::new(token, SystemTime::now() + ttl)
    }

    /// Whether the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_on <= SystemTime::now()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Issues access tokens for federated logins.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquire a token for `resource` from `authority`.
    async fn acquire_token(&self, authority: &str, resource: &str)
    -> Result<AccessToken, AuthError>;
}

/// A provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    /// Create a provider returning `token`.
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn acquire_token(
        &self,
        _authority: &str,
        _resource: &str,
    ) -> Result<AccessToken, AuthError> {
        if self.token.is_expired() {
            return Err(AuthError::TokenExpired);
        }
        Ok(self.token.clone())
    }
}
