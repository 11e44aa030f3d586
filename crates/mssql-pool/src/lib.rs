//! # mssql-driver-pool
//!
//! Pool-side collaborators of a SQL Server connection.
//!
//! Connections opened with the same settings share a [`PoolGroup`]: it
//! remembers which side of a mirrored pair accepted the last login and caches
//! federated authentication contexts by `(authority, resource)`. Connection
//! storage itself is left to the application.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use mssql_auth::AccessToken;
//! use mssql_driver_pool::{AuthContextKey, PoolGroup};
//!
//! let group = PoolGroup::new();
//! let key = AuthContextKey::new("https://sts.example", "https://db.example");
//! group
//!     .auth_contexts()
//!     .merge(key.clone(), AccessToken::valid_for("token", Duration::from_secs(60)));
//! assert!(group.auth_contexts().get(&key).is_some());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod auth_context;
pub mod error;
pub mod group;

pub use auth_context::{AuthContextCache, AuthContextKey};
pub use error::PoolError;
pub use group::{PoolGroup, PoolGroupInfo};
