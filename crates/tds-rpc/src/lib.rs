//! # tds-rpc
//!
//! The remote procedure call model used by the SQL Server client: parameters,
//! their declaration lists, and the RPC request objects a command turns into.
//!
//! This crate is intentionally IO-agnostic. It does not serialize anything to
//! bytes; the wire codec consumes [`RpcRequest`] values and the client crate
//! builds them.
//!
//! ## Example
//!
//! ```rust
//! use tds_rpc::{Parameter, RpcRequestPool, SqlDbType};
//!
//! let pool = RpcRequestPool::default();
//! let params = vec![Parameter::input("@id", SqlDbType::Int, 42)];
//!
//! let mut rpc = pool.acquire(3);
//! rpc.build_execute_sql("SELECT * FROM orders WHERE id = @id", &params)?;
//! assert_eq!(rpc.param_count(), 3);
//! pool.release(rpc);
//! # Ok::<(), tds_rpc::RpcError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cipher;
pub mod error;
pub mod param;
pub mod param_list;
pub mod pool;
pub mod rpc;
pub mod types;
pub mod version;

pub use cipher::{CipherInfoEntry, EncryptionKeyInfo, EncryptionType, ParamCipherMetadata};
pub use error::RpcError;
pub use param::{ParamValue, Parameter, ParameterCollection, ParameterDirection};
pub use param_list::{
    build_param_list, build_stored_procedure_statement_for_encryption, quote_identifier,
    sent_param_count, should_send,
};
pub use pool::RpcRequestPool;
pub use rpc::{
    ParamFlags, ParamSource, ProcId, RpcOptionFlags, RpcParam, RpcRequest, RpcTarget,
    required_slots,
};
pub use types::{EffectiveType, SqlDbType};
pub use version::TdsVersion;
