//! # mssql-auth
//!
//! Authentication and key management collaborators for SQL Server
//! connections, isolated from connection logic for better modularity and
//! testing.
//!
//! | Concern | Items |
//! |---------|-------|
//! | Login credentials | [`Credentials`] |
//! | Federated tokens | [`TokenProvider`], [`AccessToken`] |
//! | Column master key stores | [`KeyStoreProvider`], [`KeyStoreRegistry`] |
//! | Unwrapped key caching | [`CekCache`] |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod credentials;
pub mod encryption;
pub mod error;
pub mod key_store;
pub mod provider;

pub use credentials::Credentials;
pub use encryption::{EncryptionError, KeyStoreProvider, KeyStoreRegistry};
pub use error::AuthError;
pub use key_store::{CekCache, CekCacheKey, InMemoryKeyStore};
pub use provider::{AccessToken, StaticTokenProvider, TokenProvider};
