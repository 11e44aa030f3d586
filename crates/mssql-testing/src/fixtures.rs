//! Test fixture utilities.
//!
//! Configuration defaults for tests, and replies for
//! `sp_describe_parameter_encryption` matched with an in-memory key store.

use std::time::Duration;

use bytes::Bytes;
use mssql_auth::InMemoryKeyStore;
use mssql_client::{Config, ResultSet};
use tds_rpc::{EncryptionType, ParamValue};

use crate::mock_server::MockResponse;

/// Provider name the fixture key store registers under.
pub const KEY_STORE_NAME: &str = "TEST_KEY_STORE";

/// Master key path of the fixture column encryption key.
pub const KEY_PATH: &str = "cmk/test";

/// Wrapped column encryption key as the server reports it.
pub const WRAPPED_KEY: &[u8] = b"wrapped-cek";

/// Unwrapped column encryption key.
pub const PLAINTEXT_KEY: &[u8; 32] = &[7; 32];

/// Configuration for `host` with short timeouts.
#[must_use]
pub fn config(host: &str) -> Config {
    Config::new()
        .host(host)
        .connect_timeout(Some(Duration::from_secs(5)))
        .command_timeout(Some(Duration::from_secs(5)))
        .connect_retry_interval(Duration::from_secs(1))
}

/// Key store holding the fixture key.
#[must_use]
pub fn key_store() -> InMemoryKeyStore {
    InMemoryKeyStore::named(KEY_STORE_NAME).with_key(KEY_PATH, WRAPPED_KEY, PLAINTEXT_KEY)
}

/// One parameter row of a describe reply.
#[derive(Debug, Clone)]
pub struct DescribedParam {
    /// Parameter name with the leading `@`.
    pub name: String,
    /// How the parameter's column is encrypted.
    pub encryption_type: EncryptionType,
    /// Ordinal of the key in the key table.
    pub key_ordinal: u16,
}

impl DescribedParam {
    /// A parameter encrypted with the fixture key.
    pub fn encrypted(name: impl Into<String>, encryption_type: EncryptionType) -> Self {
        Self {
            name: name.into(),
            encryption_type,
            key_ordinal: 1,
        }
    }

    /// A parameter whose column is not encrypted.
    pub fn plaintext(name: impl Into<String>) -> Self {
        Self::encrypted(name, EncryptionType::Plaintext)
    }

    /// Point the parameter at another key ordinal.
    #[must_use]
    pub fn with_key_ordinal(mut self, ordinal: u16) -> Self {
        self.key_ordinal = ordinal;
        self
    }
}

/// A describe reply with the fixture key at ordinal 1.
pub fn describe_response(params: impl IntoIterator<Item = DescribedParam>) -> MockResponse {
    let keys = ResultSet::new([
        "column_encryption_key_ordinal",
        "database_id",
        "column_encryption_key_id",
        "column_encryption_key_version",
        "column_encryption_key_metadata_version",
        "column_encryption_key_encrypted_value",
        "column_master_key_store_provider_name",
        "column_master_key_path",
        "column_encryption_key_encryption_algorithm_name",
    ])
    .with_row(vec![
        ParamValue::Int(1),
        ParamValue::Int(5),
        ParamValue::Int(1),
        ParamValue::Int(1),
        ParamValue::Binary(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1])),
        ParamValue::Binary(Bytes::from_static(WRAPPED_KEY)),
        ParamValue::Text(KEY_STORE_NAME.to_string()),
        ParamValue::Text(KEY_PATH.to_string()),
        ParamValue::Text("RSA_OAEP".to_string()),
    ]);

    let mut described = ResultSet::new([
        "parameter_name",
        "column_encryption_type",
        "column_encryption_algorithm",
        "column_encryption_key_ordinal",
        "column_encryption_normalization_rule_version",
    ]);
    for param in params {
        described = described.with_row(vec![
            ParamValue::Text(param.name),
            ParamValue::Int(param.encryption_type as i64),
            ParamValue::Int(2),
            ParamValue::Int(i64::from(param.key_ordinal)),
            ParamValue::Int(1),
        ]);
    }
    MockResponse::empty()
        .with_result_set(keys)
        .with_result_set(described)
}
