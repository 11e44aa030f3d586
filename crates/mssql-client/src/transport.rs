//! Transport collaborator interfaces.
//!
//! The wire codec and network IO live outside this crate. A [`Connector`]
//! opens a [`PhysicalConnection`] to one server, the connection performs the
//! login handshake and hands out [`Session`] channels, and each session sends
//! one request and drains its response as [`ResponseItem`]s.
//!
//! ```text
//! Connector ──connect──► PhysicalConnection ──login──► LoginAck
//!                               │
//!                               └──open_session──► Session ──send/drain──► ResponseItem*
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mssql_auth::Credentials;
use tds_rpc::{ParamValue, RpcRequest, TdsVersion};

use crate::config::Config;
use crate::connection::{RoutingInfo, ServerInfo, SessionData};
use crate::error::{Result, ServerMessage};
use crate::results::ResultSet;

/// Feature id of session recovery.
pub const FEATURE_SESSION_RECOVERY: u8 = 0x01;
/// Feature id of federated authentication.
pub const FEATURE_FED_AUTH: u8 = 0x02;
/// Feature id of column encryption.
pub const FEATURE_COLUMN_ENCRYPTION: u8 = 0x04;

/// Transport security requested for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityOptions {
    /// Request an encrypted transport.
    pub encrypt: bool,
    /// Skip certificate validation.
    pub trust_server_certificate: bool,
}

impl From<&Config> for SecurityOptions {
    fn from(config: &Config) -> Self {
        Self {
            encrypt: config.encrypt,
            trust_server_certificate: config.trust_server_certificate,
        }
    }
}

/// Everything the login handshake sends.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    /// Name of the server being logged into.
    pub server_name: String,
    /// Initial database.
    pub database: Option<String>,
    /// Initial language.
    pub language: Option<String>,
    /// Application name.
    pub application_name: String,
    /// Credentials.
    pub credentials: Credentials,
    /// Federated access token, when federated authentication is used.
    pub access_token: Option<String>,
    /// Requested packet size.
    pub packet_size: u16,
    /// Highest protocol version offered.
    pub tds_version: TdsVersion,
    /// Ask the server to track recoverable session state.
    pub request_session_recovery: bool,
    /// Session state to replay, when this login recovers a broken session.
    pub recovery: Option<SessionData>,
    /// Ask for column encryption support.
    pub column_encryption: bool,
}

/// A feature the server acknowledged at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureAck {
    /// Session recovery, with the server's initial session state.
    SessionRecovery(Bytes),
    /// Federated authentication.
    FederatedAuth,
    /// Column encryption at the given version.
    ColumnEncryption(u8),
    /// Any other feature.
    Other(u8, Bytes),
}

impl FeatureAck {
    /// The feature id.
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::SessionRecovery(_) => FEATURE_SESSION_RECOVERY,
            Self::FederatedAuth => FEATURE_FED_AUTH,
            Self::ColumnEncryption(_) => FEATURE_COLUMN_ENCRYPTION,
            Self::Other(id, _) => *id,
        }
    }
}

/// What the server answered to a login.
#[derive(Debug, Clone, Default)]
pub struct LoginAck {
    /// Negotiated protocol version.
    pub tds_version: TdsVersion,
    /// Redirection to another server; nothing else in the ack applies.
    pub routing: Option<RoutingInfo>,
    /// Acknowledged features.
    pub feature_acks: Vec<FeatureAck>,
    /// Mirroring partner reported by the server.
    pub failover_partner: Option<String>,
    /// Database after login.
    pub database: Option<String>,
    /// Language after login.
    pub language: Option<String>,
    /// Collation after login.
    pub collation: Option<Bytes>,
    /// Whether the transport is encrypted.
    pub encrypted: bool,
}

/// One request on the wire.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// A plain SQL batch.
    Batch(&'a str),
    /// One or more RPCs sent as a single batch.
    Rpc(&'a [RpcRequest]),
}

/// Where a done token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKind {
    /// End of a SQL batch statement.
    Done,
    /// End of a procedure call.
    DoneProc,
    /// End of a statement inside a procedure.
    DoneInProc,
}

/// Environment changes the server reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    /// Current database changed.
    Database(String),
    /// Session language changed.
    Language(String),
    /// Collation changed.
    Collation(Bytes),
    /// The session was reset.
    ResetConnection,
}

/// A session state token: changed recoverable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateToken {
    /// Sequence number of the change.
    pub sequence: u32,
    /// Whether the server can recover this state.
    pub recoverable: bool,
    /// Changed states as `(state id, data)`.
    pub states: Vec<(u8, Bytes)>,
}

/// One decoded piece of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseItem {
    /// A complete result set.
    ResultSet(ResultSet),
    /// End of a statement or call.
    Done {
        /// Which kind of done.
        kind: DoneKind,
        /// Rows affected, when the server counted them.
        row_count: Option<u64>,
        /// The statement was cancelled by an attention.
        attention: bool,
    },
    /// An output parameter or return value by parameter ordinal.
    ReturnValue {
        /// Ordinal among the call's parameters.
        ordinal: usize,
        /// Parameter name as sent.
        name: String,
        /// Value.
        value: ParamValue,
    },
    /// Return status of a procedure.
    ReturnStatus(i32),
    /// An error message.
    Error(ServerMessage),
    /// An informational message.
    Info(ServerMessage),
    /// Environment change.
    EnvChange(EnvChange),
    /// Session state change.
    SessionState(SessionStateToken),
}

/// Sends an attention signal for a session.
pub trait Attention: Send + Sync {
    /// Ask the server to stop the current request. Never blocks.
    fn send_attention(&self);
}

/// A per-call channel on a physical connection.
#[async_trait]
pub trait Session: Send {
    /// Write a request.
    async fn send(&mut self, request: Request<'_>, timeout: Option<Duration>) -> Result<()>;

    /// Read the whole response to the last request.
    async fn drain(&mut self) -> Result<Vec<ResponseItem>>;

    /// Handle for cancelling the in-flight request.
    fn attention(&self) -> Arc<dyn Attention>;
}

/// One network connection to one server.
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Perform the login handshake.
    async fn login(&self, request: &LoginRequest) -> Result<LoginAck>;

    /// Open a channel for one call.
    fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Whether the underlying socket is still usable.
    fn is_alive(&self) -> bool;

    /// Failover partner announced by the server, even if the login failed.
    fn server_failover_partner(&self) -> Option<String> {
        None
    }

    /// Close the connection.
    async fn close(&self);
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `server` within `budget` (`None` is unbounded).
    async fn connect(
        &self,
        server: &ServerInfo,
        budget: Option<Duration>,
        security: SecurityOptions,
    ) -> Result<Arc<dyn PhysicalConnection>>;
}

/// Executes commands in-process, bypassing the network.
#[async_trait]
pub trait LoopbackExecutor: Send + Sync {
    /// Run the request and return its response.
    async fn execute(&self, request: Request<'_>) -> Result<Vec<ResponseItem>>;
}
