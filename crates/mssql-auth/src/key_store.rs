//! In-memory key store and the decrypted CEK cache.
//!
//! - [`InMemoryKeyStore`]: a key store for tests and development
//! - [`CekCache`]: a thread-safe cache of unwrapped column encryption keys
//!
//! ## Production Usage
//!
//! For production environments, implement [`KeyStoreProvider`] against a real
//! key store (Azure Key Vault, Windows Certificate Store, an HSM).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::encryption::{EncryptionError, KeyStoreProvider};

/// Provider name of [`InMemoryKeyStore`].
pub const IN_MEMORY_PROVIDER_NAME: &str = "IN_MEMORY_KEY_STORE";

/// In-memory key store for testing and development.
///
/// Maps `(cmk_path, wrapped key)` to the unwrapped key. **Security Warning**:
/// keys are held in plain memory.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    name: Option<String>,
    keys: HashMap<(String, Vec<u8>), Vec<u8>>,
    decrypt_calls: AtomicUsize,
}

impl InMemoryKeyStore {
    /// Create an empty store named [`IN_MEMORY_PROVIDER_NAME`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that reports a custom provider name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Register the plaintext for a wrapped key under a master key path.
    pub fn add_key(&mut self, cmk_path: &str, encrypted_cek: &[u8], plaintext: &[u8]) {
        self.keys.insert(
            (cmk_path.to_string(), encrypted_cek.to_vec()),
            plaintext.to_vec(),
        );
    }

    /// Builder-style [`add_key`](Self::add_key).
    #[must_use]
    pub fn with_key(mut self, cmk_path: &str, encrypted_cek: &[u8], plaintext: &[u8]) -> Self {
        self.add_key(cmk_path, encrypted_cek, plaintext);
        self
    }

    /// Number of keys in the store.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// How many unwrap requests the store has served.
    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl KeyStoreProvider for InMemoryKeyStore {
    fn provider_name(&self) -> &str {
        self.name.as_deref().unwrap_or(IN_MEMORY_PROVIDER_NAME)
    }

    async fn decrypt_cek(
        &self,
        cmk_path: &str,
        _algorithm: &str,
        encrypted_cek: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        self.decrypt_calls.fetch_add(1, Ordering::Relaxed);
        self.keys
            .get(&(cmk_path.to_string(), encrypted_cek.to_vec()))
            .cloned()
            .ok_or_else(|| EncryptionError::CmkError(format!("key not found: {cmk_path}")))
    }
}

/// Key for CEK cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CekCacheKey {
    /// Database id.
    pub database_id: i32,
    /// CEK id within the database.
    pub key_id: i32,
    /// CEK version.
    pub key_version: i32,
    /// Key metadata version.
    pub md_version: [u8; 8],
}

impl CekCacheKey {
    /// Create a new cache key.
    pub fn new(database_id: i32, key_id: i32, key_version: i32, md_version: [u8; 8]) -> Self {
        Self {
            database_id,
            key_id,
            key_version,
            md_version,
        }
    }
}

struct CekCacheEntry {
    cek: Bytes,
    created_at: Instant,
}

/// Thread-safe cache for unwrapped column encryption keys.
///
/// Entries expire after a configurable TTL (default: 2 hours) and are
/// lazily skipped on access.
pub struct CekCache {
    entries: RwLock<HashMap<CekCacheKey, CekCacheEntry>>,
    ttl: Duration,
}

impl CekCache {
    /// Create a cache with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(2 * 60 * 60))
    }

    /// Create a cache with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get an unexpired key.
    pub fn get(&self, key: &CekCacheKey) -> Option<Bytes> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.created_at.elapsed() < self.ttl)
            .map(|entry| entry.cek.clone())
    }

    /// Insert a key.
    pub fn insert(&self, key: CekCacheKey, cek: Bytes) {
        self.entries.write().insert(
            key,
            CekCacheEntry {
                cek,
                created_at: Instant::now(),
            },
        );
    }

    /// Return the cached key, or fetch and cache it.
    pub async fn get_or_insert<F, Fut>(
        &self,
        key: CekCacheKey,
        fetch: F,
    ) -> Result<Bytes, EncryptionError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes, EncryptionError>>,
    {
        if let Some(cek) = self.get(&key) {
            return Ok(cek);
        }
        let cek = fetch().await?;
        self.insert(key, cek.clone());
        Ok(cek)
    }

    /// Remove a key.
    pub fn remove(&self, key: &CekCacheKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drop expired entries.
    pub fn cleanup_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .retain(|_, entry| entry.created_at.elapsed() < ttl);
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for CekCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CekCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CekCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
