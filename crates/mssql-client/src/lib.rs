//! # mssql-client
//!
//! The command pipeline and resilient connection layer of a SQL Server client.
//!
//! The wire codec is not part of this crate: a [`Connector`] opens physical
//! connections and exchanges typed requests and responses. On top of it this
//! crate provides:
//!
//! - **Commands**: text or stored procedure calls turned into RPC requests,
//!   with automatic `sp_executesql` / `sp_prepexec` / `sp_execute` selection
//!   for prepared statements and multi-call batches.
//! - **Parameter encryption**: parameters are described by the server and
//!   their column encryption keys unwrapped through pluggable key stores.
//! - **Failover and routing**: login races the primary and its mirroring
//!   partner with growing time slices and follows one routing redirect.
//! - **Session recovery**: a broken connection is transparently re-established
//!   by the next command, replaying session state the server acknowledged.
//! - **Cancellation and timeouts**: attention signals sent from any task.
//!
//! ## Connection States
//!
//! ```text
//! Disconnected -> Connecting -> LoggingIn -> LoggedIn
//! LoggedIn -> Reconnecting -> LoggedIn | Disconnected   (link breaks)
//! any -> Doomed                                          (fatal error)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_client::{Command, Config, Connection};
//! use tds_rpc::{Parameter, SqlDbType};
//!
//! let config = Config::from_connection_string(
//!     "Server=tcp:primary,1433;Failover Partner=mirror;Database=orders;User Id=app;Password=secret;",
//! )?;
//! let conn = Connection::open(config, connector).await?;
//!
//! let cmd = Command::new("SELECT name FROM customers WHERE id = @id")
//!     .with_param(Parameter::input("@id", SqlDbType::Int, 7));
//! cmd.prepare(&conn)?;
//! let mut rows = cmd.execute_query(&conn).await?;
//! while let Some(row) = rows.next_row() {
//!     println!("{:?}", row.get_str(0));
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod blocking;
pub mod cancel;
pub mod command;
pub mod config;
pub mod connection;
pub mod encryption;
mod engine;
pub mod error;
pub mod prepared;
pub mod results;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancelHandle;
pub use command::{Command, PendingExecution};
pub use config::{ColumnEncryptionSetting, CommandKind, Config, LoginBackoff, TransientErrors};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionState, RoutingInfo, ServerInfo, SessionData,
    SessionStats,
};
pub use error::{Error, Result, ServerMessage};
pub use mssql_auth::Credentials;
pub use prepared::{ConnectionCounters, PrepareState};
pub use results::{BatchItemResult, BatchResults, Column, ExecuteResult, OutputParam, ResultSet, Row, RowStream};
pub use transport::{
    Attention, Connector, DoneKind, EnvChange, FeatureAck, LoginAck, LoginRequest,
    LoopbackExecutor, PhysicalConnection, Request, ResponseItem, SecurityOptions, Session,
    SessionStateToken,
};
