//! Column master key providers for parameter encryption.
//!
//! Encrypted parameters are protected by a column encryption key (CEK). The
//! server only knows the CEK wrapped under one or more column master keys
//! (CMKs), which live in external key stores. A [`KeyStoreProvider`] unwraps
//! a CEK using its CMK; the [`KeyStoreRegistry`] picks the provider by the
//! key store name the server reports.
//!
//! ```text
//! Column Master Key (CMK)      stored in a key store, never sent to the server
//!          │
//!          ▼ wraps
//! Column Encryption Key (CEK)  stored wrapped in the database, unwrapped here
//!          │
//!          ▼ encrypts
//! Parameter values
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Errors raised by key store providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EncryptionError {
    /// No provider is registered under this name.
    #[error("key store provider not found: {0}")]
    KeyStoreNotFound(String),

    /// The master key could not be located or used.
    #[error("column master key error: {0}")]
    CmkError(String),

    /// Unwrapping the column encryption key failed.
    #[error("failed to decrypt column encryption key: {0}")]
    CekDecryptionFailed(String),

    /// The operation is not supported by this provider.
    #[error("unsupported operation with encryption: {0}")]
    UnsupportedOperation(String),

    /// Registry configuration error.
    #[error("encryption configuration error: {0}")]
    ConfigurationError(String),
}

/// A column master key store.
///
/// Implementations must never log key material.
///
/// # Example
///
/// ```rust,ignore
/// use mssql_auth::encryption::{EncryptionError, KeyStoreProvider};
///
/// struct VaultProvider;
///
/// #[async_trait::async_trait]
/// impl KeyStoreProvider for VaultProvider {
///     fn provider_name(&self) -> &str {
///         "AZURE_KEY_VAULT"
///     }
///
///     async fn decrypt_cek(
///         &self,
///         cmk_path: &str,
///         algorithm: &str,
///         encrypted_cek: &[u8],
///     ) -> Result<Vec<u8>, EncryptionError> {
///         // unwrap with the vault
///         # unimplemented!()
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait KeyStoreProvider: Send + Sync {
    /// Provider name as reported in server metadata, e.g. `AZURE_KEY_VAULT`.
    fn provider_name(&self) -> &str;

    /// Unwrap a column encryption key with the master key at `cmk_path`.
    async fn decrypt_cek(
        &self,
        cmk_path: &str,
        algorithm: &str,
        encrypted_cek: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;
}

/// Registered key store providers, looked up by name.
#[derive(Clone, Default)]
pub struct KeyStoreRegistry {
    providers: HashMap<String, Arc<dyn KeyStoreProvider>>,
}

impl KeyStoreRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn KeyStoreProvider>) {
        self.providers
            .insert(provider.provider_name().to_string(), provider);
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with_provider(mut self, provider: impl KeyStoreProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    /// Look up a provider.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyStoreProvider>> {
        self.providers.get(name).cloned()
    }

    /// Whether any provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Unwrap a CEK with the named provider.
    pub async fn decrypt(
        &self,
        key_store_name: &str,
        cmk_path: &str,
        algorithm: &str,
        encrypted_cek: &[u8],
    ) -> Result<Bytes, EncryptionError> {
        let provider = self
            .get(key_store_name)
            .ok_or_else(|| EncryptionError::KeyStoreNotFound(key_store_name.to_string()))?;
        tracing::debug!(key_store = key_store_name, cmk_path, "unwrapping column encryption key");
        let plaintext = provider
            .decrypt_cek(cmk_path, algorithm, encrypted_cek)
            .await?;
        Ok(Bytes::from(plaintext))
    }
}

impl fmt::Debug for KeyStoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("KeyStoreRegistry")
            .field("providers", &names)
            .finish()
    }
}
