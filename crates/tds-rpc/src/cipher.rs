//! Column encryption key metadata.
//!
//! A [`CipherInfoEntry`] gathers every wrapping of one column encryption key
//! (CEK) as reported by the server. The first wrapping recorded for an ordinal
//! fixes the key identity; later wrappings must agree with it.

use bytes::Bytes;

use crate::error::RpcError;

/// One wrapping of a column encryption key under a column master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKeyInfo {
    /// The CEK encrypted with the master key.
    pub encrypted_key: Bytes,
    /// Name of the key store provider holding the master key.
    pub key_store_name: String,
    /// Path of the master key inside the key store.
    pub key_path: String,
    /// Algorithm used to wrap the CEK.
    pub algorithm_name: String,
}

/// All known wrappings of one column encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfoEntry {
    ordinal: u16,
    database_id: i32,
    key_id: i32,
    key_version: i32,
    key_md_version: [u8; 8],
    keys: Vec<EncryptionKeyInfo>,
}

impl CipherInfoEntry {
    /// Create an empty entry for an ordinal.
    #[must_use]
    pub fn new(ordinal: u16) -> Self {
        Self {
            ordinal,
            database_id: 0,
            key_id: 0,
            key_version: 0,
            key_md_version: [0; 8],
            keys: Vec::new(),
        }
    }

    /// Record one wrapping of the key.
    ///
    /// The first call fixes `(database_id, key_id, key_version, md_version)`;
    /// any later call with a different tuple is rejected.
    pub fn add(
        &mut self,
        key: EncryptionKeyInfo,
        database_id: i32,
        key_id: i32,
        key_version: i32,
        key_md_version: [u8; 8],
    ) -> Result<(), RpcError> {
        if self.keys.is_empty() {
            self.database_id = database_id;
            self.key_id = key_id;
            self.key_version = key_version;
            self.key_md_version = key_md_version;
        } else if self.database_id != database_id
            || self.key_id != key_id
            || self.key_version != key_version
            || self.key_md_version != key_md_version
        {
            return Err(RpcError::ConflictingKeyMetadata {
                ordinal: self.ordinal,
                expected_db: self.database_id,
                expected_key: self.key_id,
                expected_version: self.key_version,
                db: database_id,
                key: key_id,
                version: key_version,
            });
        }
        self.keys.push(key);
        Ok(())
    }

    /// Key ordinal.
    #[must_use]
    pub fn ordinal(&self) -> u16 {
        self.ordinal
    }

    /// Database id of the key.
    #[must_use]
    pub fn database_id(&self) -> i32 {
        self.database_id
    }

    /// Key id.
    #[must_use]
    pub fn key_id(&self) -> i32 {
        self.key_id
    }

    /// Key version.
    #[must_use]
    pub fn key_version(&self) -> i32 {
        self.key_version
    }

    /// Key metadata version.
    #[must_use]
    pub fn key_md_version(&self) -> [u8; 8] {
        self.key_md_version
    }

    /// Every wrapping, in the order received.
    #[must_use]
    pub fn keys(&self) -> &[EncryptionKeyInfo] {
        &self.keys
    }
}

/// Encryption type of a column or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Not encrypted.
    Plaintext,
    /// Deterministic encryption.
    Deterministic,
    /// Randomized encryption.
    Randomized,
}

impl EncryptionType {
    /// Map the wire byte to an encryption type.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Plaintext),
            1 => Some(Self::Deterministic),
            2 => Some(Self::Randomized),
            _ => None,
        }
    }
}

/// Encryption metadata attached to a parameter before it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamCipherMetadata {
    /// The key the parameter is encrypted with.
    pub entry: CipherInfoEntry,
    /// Algorithm id.
    pub algorithm_id: u8,
    /// Algorithm name, for custom algorithms.
    pub algorithm_name: Option<String>,
    /// Deterministic or randomized.
    pub encryption_type: EncryptionType,
    /// Normalization rule version.
    pub normalization_rule_version: u8,
    /// The decrypted column encryption key.
    pub symmetric_key: Bytes,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn wrapping(store: &str) -> EncryptionKeyInfo {
        EncryptionKeyInfo {
            encrypted_key: Bytes::from_static(&[1, 2, 3]),
            key_store_name: store.into(),
            key_path: "CurrentUser/My/ABC".into(),
            algorithm_name: "RSA_OAEP".into(),
        }
    }

    #[test]
    fn test_first_add_fixes_identity() {
        let mut entry = CipherInfoEntry::new(1);
        entry.add(wrapping("A"), 5, 10, 1, [1; 8]).unwrap();
        entry.add(wrapping("B"), 5, 10, 1, [1; 8]).unwrap();
        assert_eq!(entry.keys().len(), 2);
        assert_eq!(entry.database_id(), 5);
        assert_eq!(entry.key_id(), 10);
    }

    #[test]
    fn test_mismatched_add_rejected() {
        let mut entry = CipherInfoEntry::new(2);
        entry.add(wrapping("A"), 5, 10, 1, [1; 8]).unwrap();
        let err = entry.add(wrapping("B"), 5, 11, 1, [1; 8]).unwrap_err();
        assert!(matches!(
            err,
            RpcError::ConflictingKeyMetadata { ordinal: 2, .. }
        ));
        let err = entry.add(wrapping("B"), 5, 10, 1, [2; 8]).unwrap_err();
        assert!(matches!(err, RpcError::ConflictingKeyMetadata { .. }));
        assert_eq!(entry.keys().len(), 1);
    }

    #[test]
    fn test_encryption_type_from_u8() {
        assert_eq!(EncryptionType::from_u8(0), Some(EncryptionType::Plaintext));
        assert_eq!(EncryptionType::from_u8(2), Some(EncryptionType::Randomized));
        assert_eq!(EncryptionType::from_u8(9), None);
    }
}
