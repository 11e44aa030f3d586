//! Pool group errors.

use thiserror::Error;

/// Errors raised by a pool group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool group has been shut down.
    #[error("pool group is closed")]
    PoolClosed,
}
