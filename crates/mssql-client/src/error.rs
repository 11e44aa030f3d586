//! Client error types.

use std::sync::Arc;

use mssql_auth::{AuthError, EncryptionError};
use mssql_driver_pool::PoolError;
use tds_rpc::RpcError;
use thiserror::Error;

use crate::config::TransientErrors;

/// Server error number for a failed login.
pub const LOGON_FAILED: i32 = 18456;
/// Server error number for an expired password.
pub const PASSWORD_EXPIRED: i32 = 18488;
/// Server error number for a failed impersonation.
pub const IMPERSONATION_FAILED: i32 = 1346;

/// Lowest severity class the server uses for errors; anything below is informational.
pub const MIN_ERROR_CLASS: u8 = 11;

/// An error or informational message reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Severity class (0-25).
    pub class: u8,
    /// Message state.
    pub state: u8,
    /// Message text.
    pub message: String,
    /// Server that produced the message.
    pub server: Option<String>,
    /// Procedure the message was raised in.
    pub procedure: Option<String>,
    /// Line number in the batch or procedure.
    pub line: u32,
}

impl ServerMessage {
    /// Create a message with the given number, class, and text.
    pub fn new(number: i32, class: u8, message: impl Into<String>) -> Self {
        Self {
            number,
            class,
            state: 1,
            message: message.into(),
            server: None,
            procedure: None,
            line: 1,
        }
    }

    /// Whether the message is an error rather than a warning.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.class >= MIN_ERROR_CLASS
    }
}

/// Errors that can occur during client operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A second asynchronous operation was started while one is pending.
    #[error("an asynchronous operation is already pending on this command")]
    PendingAsyncOperation,

    /// The command has no text to execute.
    #[error("command text was not set")]
    NoCommandText,

    /// A parameter or request failed validation.
    #[error("invalid parameter: {0}")]
    Rpc(#[from] RpcError),

    /// The call is not valid in the command's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The connection is closed or unusable.
    #[error("connection closed")]
    ConnectionClosed,

    /// A blocking call was made from inside an async runtime.
    #[error("blocking call made from within an async runtime")]
    BlockingInAsyncContext,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where error occurred.
        server: Option<String>,
        /// Stored procedure name (if applicable).
        procedure: Option<String>,
        /// Line number in the SQL batch or procedure.
        line: u32,
        /// Every error and warning the server reported with this one.
        messages: Vec<ServerMessage>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Connection timeout occurred.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Command execution timeout occurred.
    #[error("command timed out")]
    CommandTimeout,

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Key store error while resolving parameter encryption.
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// A parameter sent for encryption description came back without metadata.
    #[error("encryption metadata missing for parameter {param} in statement '{statement}'")]
    ParamEncryptionMetadataMissing {
        /// Parameter name.
        param: String,
        /// Statement text.
        statement: String,
    },

    /// A procedure parameter came back without encryption metadata.
    #[error("encryption metadata missing for parameter {param} of procedure {procedure}")]
    ProcEncryptionMetadataMissing {
        /// Procedure name.
        procedure: String,
        /// Parameter name.
        param: String,
    },

    /// A parameter references a key ordinal the key table did not list.
    #[error("parameter {param} references unknown encryption key ordinal {ordinal}")]
    InvalidEncryptionKeyOrdinal {
        /// Key ordinal.
        ordinal: u16,
        /// Parameter name.
        param: String,
    },

    /// The parameter-encryption description came back in an unexpected shape.
    #[error("unexpected describe parameter encryption result: {0}")]
    UnexpectedDescribeParamFormat(String),

    /// The server redirected a login that had already been redirected.
    #[error("recursive routing is not supported")]
    RecursiveRoutingNotSupported,

    /// The server sent routing information during a failover login.
    #[error("unexpected routing information during failover login")]
    UnexpectedRoutingInfo,

    /// Routing information arrived after the connect timeout expired.
    #[error("timeout expired after routing information was received")]
    RoutingAfterTimeout,

    /// Recovery data was offered but the server did not acknowledge it.
    #[error("server did not acknowledge session recovery during reconnection")]
    SessionRecoveryNotAcknowledged,

    /// The recovered session negotiated a different protocol version.
    #[error("session recovery changed the protocol version from {expected} to {actual}")]
    SessionRecoveryVersionMismatch {
        /// Version negotiated by the original session.
        expected: tds_rpc::TdsVersion,
        /// Version negotiated by the recovered session.
        actual: tds_rpc::TdsVersion,
    },

    /// The recovered session negotiated different encryption.
    #[error("encryption setting changed during session recovery")]
    EncryptionChangedOnReconnect,

    /// The server acknowledged a feature that was never requested.
    #[error("server acknowledged unrequested feature {0:#04x}")]
    UnrequestedFeatureAck(u8),

    /// Federated authentication was requested but not acknowledged.
    #[error("server did not acknowledge federated authentication")]
    FederatedAuthNotAcknowledged,

    /// Connected to the failover partner, but it reports no mirroring partner.
    #[error("server {partner} is not configured as a failover partner for database '{database}'")]
    InvalidPartnerConfiguration {
        /// Failover host that was connected.
        partner: String,
        /// Current database.
        database: String,
    },

    /// Multi-subnet failover cannot be combined with a failover partner.
    #[error("multi-subnet failover cannot be used with a failover partner")]
    MultiSubnetFailoverWithPartner,

    /// Malformed data from the transport.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Waiting for a reconnection exceeded the command timeout.
    #[error("timed out waiting for connection recovery")]
    ReconnectTimeout,

    /// Every reconnection attempt failed.
    #[error("connection recovery failed after all attempts: {0}")]
    ReconnectAllAttemptsFailed(Box<Error>),

    /// The next reconnection attempt would start after the command timeout.
    #[error("next recovery attempt would exceed the command timeout: {0}")]
    ReconnectWouldExceedTimeout(Box<Error>),

    /// The session holds state the server marked unrecoverable.
    #[error("connection cannot be recovered: session state is not recoverable")]
    UnrecoverableSession,

    /// The operation was cancelled.
    #[error("operation cancelled by user")]
    OperationCancelled,

    /// Unrecoverable runtime failure; the connection is doomed.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// A login error the server marked as not worth retrying.
    #[error("{0}")]
    NoReconnect(Box<Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<&ServerMessage> for Error {
    fn from(msg: &ServerMessage) -> Self {
        Self::server(msg, vec![msg.clone()])
    }
}

impl Error {
    /// Build a server error from its first message and the full message collection.
    pub fn server(first: &ServerMessage, messages: Vec<ServerMessage>) -> Self {
        Self::Server {
            number: first.number,
            class: first.class,
            state: first.state,
            message: first.message.clone(),
            server: first.server.clone(),
            procedure: first.procedure.clone(),
            line: first.line,
            messages,
        }
    }

    /// Check if this error is transient and may succeed on retry.
    ///
    /// Only server errors whose number is in `transient` qualify.
    #[must_use]
    pub fn is_transient(&self, transient: &TransientErrors) -> bool {
        match self {
            Self::Server { number, .. } => transient.contains(*number),
            _ => false,
        }
    }

    /// Whether ordinary cleanup may run for this error.
    ///
    /// Fatal errors skip cleanup and doom the connection instead.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Check if this error indicates a protocol-logic failure.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ParamEncryptionMetadataMissing { .. }
                | Self::ProcEncryptionMetadataMissing { .. }
                | Self::InvalidEncryptionKeyOrdinal { .. }
                | Self::UnexpectedDescribeParamFormat(_)
                | Self::RecursiveRoutingNotSupported
                | Self::UnexpectedRoutingInfo
                | Self::RoutingAfterTimeout
                | Self::SessionRecoveryNotAcknowledged
                | Self::SessionRecoveryVersionMismatch { .. }
                | Self::EncryptionChangedOnReconnect
                | Self::UnrequestedFeatureAck(_)
                | Self::FederatedAuthNotAcknowledged
                | Self::InvalidPartnerConfiguration { .. }
                | Self::MultiSubnetFailoverWithPartner
                | Self::Protocol(_)
                | Self::Rpc(RpcError::ConflictingKeyMetadata { .. })
        )
    }

    /// Check if this error is a usage error. These are never retried.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        match self {
            Self::Rpc(e) => !matches!(e, RpcError::ConflictingKeyMetadata { .. }),
            _ => matches!(
                self,
                Self::PendingAsyncOperation
                    | Self::NoCommandText
                    | Self::InvalidOperation(_)
                    | Self::ConnectionClosed
                    | Self::BlockingInAsyncContext
                    | Self::Config(_)
            ),
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        match self {
            Self::Server { number: n, .. } => *n == number,
            Self::NoReconnect(inner) => inner.is_server_error(number),
            _ => false,
        }
    }

    /// Get the error class/severity if this is a server error.
    ///
    /// SQL Server error classes range from 0-25:
    /// - 0-10: Informational
    /// - 11-16: User errors
    /// - 17-19: Resource/hardware errors
    /// - 20-25: System errors (connection terminating)
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            Self::NoReconnect(inner) => inner.class(),
            _ => None,
        }
    }

    /// Whether a failed login must not be retried.
    #[must_use]
    pub fn is_do_not_retry_login(&self) -> bool {
        match self {
            Self::NoReconnect(_) => true,
            Self::Server { number, .. } => {
                matches!(*number, LOGON_FAILED | PASSWORD_EXPIRED | IMPERSONATION_FAILED)
            }
            _ => false,
        }
    }

    /// The server messages attached to this error, if any.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        match self {
            Self::Server { messages, .. } => messages,
            Self::NoReconnect(inner) => inner.messages(),
            _ => &[],
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
