//! Errors raised while obtaining login material.

use thiserror::Error;

/// Failure to produce the token or credentials a login needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The provider only holds an expired token.
    #[error("token expired or invalid")]
    TokenExpired,

    /// The authority refused or could not be reached.
    #[error("failed to acquire token from {authority}: {reason}")]
    TokenAcquisition {
        /// Authority the token was requested from.
        authority: String,
        /// Provider-specific reason.
        reason: String,
    },
}
