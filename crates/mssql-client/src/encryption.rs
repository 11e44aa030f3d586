//! Transparent parameter encryption.
//!
//! Before a call whose parameters may be encrypted is sent, the server is asked
//! to describe them with `sp_describe_parameter_encryption`. Each describe
//! reply carries two result sets:
//!
//! 1. the keys, one row per wrapping of each key ordinal:
//!    `(ordinal, db id, key id, key version, md version, encrypted key,
//!    provider, key path, algorithm)`;
//! 2. the parameters:
//!    `(name, encryption type, algorithm id, key ordinal, normalization version)`.
//!
//! Keys are unwrapped through the connection's key store registry and cached;
//! the resulting cipher metadata is attached to the matching parameter so the
//! real call is sent with the encrypted bit set.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use mssql_auth::{CekCacheKey, EncryptionError};
use tds_rpc::{
    CipherInfoEntry, EncryptionKeyInfo, EncryptionType, ParamCipherMetadata, Parameter,
    ParameterDirection, RpcRequest, RpcTarget, SqlDbType, build_param_list,
    build_stored_procedure_statement_for_encryption, required_slots,
};

use crate::config::CommandKind;
use crate::connection::Connection;
use crate::engine::{Call, Channel, collect_errors};
use crate::error::{Error, Result};
use crate::results::{ResultSet, Row};
use crate::transport::{DoneKind, Request, ResponseItem};

/// System procedure that describes parameter encryption.
pub const DESCRIBE_PARAMETER_ENCRYPTION: &str = "sp_describe_parameter_encryption";

/// Whether a call has anything to describe.
fn needs_description(call: &Call) -> bool {
    call.params
        .iter()
        .any(|p| p.direction != ParameterDirection::ReturnValue)
}

/// Build the describe call for one call.
pub(crate) fn build_describe(call: &Call, rpc: &mut RpcRequest) -> Result<()> {
    let is_proc = call.kind == CommandKind::StoredProcedure;
    let statement = if is_proc {
        build_stored_procedure_statement_for_encryption(&call.text, call.params.as_slice())?
    } else {
        call.text.clone()
    };
    let declarations = build_param_list(call.params.as_slice(), true)?;
    let params = describe_params(statement, declarations);
    rpc.build_named(DESCRIBE_PARAMETER_ENCRYPTION, &params)?;
    Ok(())
}

fn describe_params(statement: String, declarations: String) -> [Parameter; 2] {
    [
        Parameter::input("@tsql", SqlDbType::NVarChar, statement),
        Parameter::input("@params", SqlDbType::NVarChar, declarations),
    ]
}

/// Describe and resolve encryption for every call that needs it.
///
/// Runs on the caller's channel. Calls without parameters cost nothing; when
/// no call needs a description no round trip is made.
pub(crate) async fn describe_and_apply(
    conn: &Connection,
    channel: &mut Channel,
    calls: &mut [Call],
    timeout: Option<Duration>,
) -> Result<()> {
    // Describe call k belongs to calls[origin[k]].
    let mut origin = Vec::new();
    let mut rpcs = Vec::new();
    for (index, call) in calls.iter().enumerate() {
        if !needs_description(call) {
            continue;
        }
        let target = RpcTarget::Name(DESCRIBE_PARAMETER_ENCRYPTION.to_string());
        let mut rpc = conn
            .rpc_pool()
            .acquire(required_slots(&target, &describe_params(String::new(), String::new())));
        if let Err(e) = build_describe(call, &mut rpc) {
            conn.rpc_pool().release(rpc);
            conn.rpc_pool().release_all(rpcs);
            return Err(e);
        }
        origin.push(index);
        rpcs.push(rpc);
    }
    if rpcs.is_empty() {
        return Ok(());
    }

    tracing::debug!(calls = rpcs.len(), "describing parameter encryption");
    let items = channel.round_trip(conn, Request::Rpc(&rpcs), timeout).await;
    conn.rpc_pool().release_all(rpcs);
    let items = items?;

    let (errors, _) = collect_errors(&items);
    if let Some(first) = errors.first() {
        return Err(Error::server(first, errors.clone()));
    }

    let replies = split_replies(items);
    if replies.len() < origin.len() {
        return Err(Error::UnexpectedDescribeParamFormat(format!(
            "expected {} describe replies, got {}",
            origin.len(),
            replies.len()
        )));
    }
    for (reply, index) in replies.into_iter().zip(origin) {
        apply_reply(conn, &mut calls[index], reply).await?;
    }
    Ok(())
}

/// Group the result sets of a batched describe by call.
fn split_replies(items: Vec<ResponseItem>) -> Vec<Vec<ResultSet>> {
    let mut replies = Vec::new();
    let mut current = Vec::new();
    for item in items {
        match item {
            ResponseItem::ResultSet(set) => current.push(set),
            ResponseItem::Done {
                kind: DoneKind::DoneProc,
                ..
            } => replies.push(std::mem::take(&mut current)),
            _ => {}
        }
    }
    if !current.is_empty() {
        replies.push(current);
    }
    replies
}

fn format_error(what: &str) -> Error {
    Error::UnexpectedDescribeParamFormat(what.to_string())
}

fn int_column(row: &Row, index: usize, what: &str) -> Result<i64> {
    row.get_i64(index).ok_or_else(|| format_error(what))
}

fn str_column<'a>(row: &'a Row, index: usize, what: &str) -> Result<&'a str> {
    row.get_str(index).ok_or_else(|| format_error(what))
}

fn narrow<T: TryFrom<i64>>(value: i64, what: &str) -> Result<T> {
    T::try_from(value).map_err(|_| format_error(what))
}

/// Read the key table into entries by ordinal.
fn read_keys(set: &ResultSet) -> Result<BTreeMap<u16, CipherInfoEntry>> {
    let mut entries: BTreeMap<u16, CipherInfoEntry> = BTreeMap::new();
    for row in &set.rows {
        let ordinal: u16 = narrow(int_column(row, 0, "key ordinal")?, "key ordinal")?;
        let database_id: i32 = narrow(int_column(row, 1, "database id")?, "database id")?;
        let key_id: i32 = narrow(int_column(row, 2, "key id")?, "key id")?;
        let key_version: i32 = narrow(int_column(row, 3, "key version")?, "key version")?;
        let md_version: [u8; 8] = row
            .get_bytes(4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| format_error("key metadata version"))?;
        let key = EncryptionKeyInfo {
            encrypted_key: Bytes::copy_from_slice(
                row.get_bytes(5).ok_or_else(|| format_error("encrypted key"))?,
            ),
            key_store_name: str_column(row, 6, "provider name")?.to_string(),
            key_path: str_column(row, 7, "key path")?.to_string(),
            algorithm_name: str_column(row, 8, "key encryption algorithm")?.to_string(),
        };
        entries
            .entry(ordinal)
            .or_insert_with(|| CipherInfoEntry::new(ordinal))
            .add(key, database_id, key_id, key_version, md_version)?;
    }
    Ok(entries)
}

/// Attach cipher metadata from one describe reply to its call's parameters.
async fn apply_reply(conn: &Connection, call: &mut Call, reply: Vec<ResultSet>) -> Result<()> {
    let [keys, params, ..] = reply.as_slice() else {
        return Err(format_error("describe reply must contain two result sets"));
    };
    let entries = read_keys(keys)?;
    let mut described = HashSet::new();

    for row in &params.rows {
        let name = str_column(row, 0, "parameter name")?;
        let Some(index) = call.params.iter().position(|p| p.name_fixed() == name) else {
            continue;
        };
        let raw_type: u8 = narrow(int_column(row, 1, "encryption type")?, "encryption type")?;
        let encryption_type =
            EncryptionType::from_u8(raw_type).ok_or_else(|| format_error("encryption type"))?;
        described.insert(index);
        if encryption_type == EncryptionType::Plaintext {
            continue;
        }

        let algorithm_id: u8 = narrow(int_column(row, 2, "algorithm id")?, "algorithm id")?;
        let ordinal: u16 = narrow(int_column(row, 3, "key ordinal")?, "key ordinal")?;
        let normalization_rule_version: u8 =
            narrow(int_column(row, 4, "normalization rule version")?, "normalization rule version")?;
        let entry = entries
            .get(&ordinal)
            .ok_or_else(|| Error::InvalidEncryptionKeyOrdinal {
                ordinal,
                param: name.to_string(),
            })?;
        let symmetric_key = resolve_key(conn, entry).await?;
        if let Some(param) = call.params.as_mut_slice().get_mut(index) {
            param.cipher = Some(ParamCipherMetadata {
                entry: entry.clone(),
                algorithm_id,
                algorithm_name: None,
                encryption_type,
                normalization_rule_version,
                symmetric_key,
            });
        }
    }

    for (index, param) in call.params.iter().enumerate() {
        if param.direction == ParameterDirection::ReturnValue || described.contains(&index) {
            continue;
        }
        return Err(match call.kind {
            CommandKind::Text => Error::ParamEncryptionMetadataMissing {
                param: param.name_fixed(),
                statement: call.text.clone(),
            },
            CommandKind::StoredProcedure => Error::ProcEncryptionMetadataMissing {
                procedure: call.text.clone(),
                param: param.name_fixed(),
            },
        });
    }
    Ok(())
}

/// Unwrap a column encryption key, trying each wrapping in order.
async fn resolve_key(conn: &Connection, entry: &CipherInfoEntry) -> Result<Bytes> {
    let cache_key = CekCacheKey::new(
        entry.database_id(),
        entry.key_id(),
        entry.key_version(),
        entry.key_md_version(),
    );
    let cek = conn
        .cek_cache()
        .get_or_insert(cache_key, || async {
            let mut last = EncryptionError::CekDecryptionFailed(format!(
                "no key wrappings for ordinal {}",
                entry.ordinal()
            ));
            for wrapping in entry.keys() {
                match conn
                    .key_stores()
                    .decrypt(
                        &wrapping.key_store_name,
                        &wrapping.key_path,
                        &wrapping.algorithm_name,
                        &wrapping.encrypted_key,
                    )
                    .await
                {
                    Ok(key) => return Ok(key),
                    Err(e) => {
                        tracing::debug!(key_store = %wrapping.key_store_name, error = %e, "key wrapping failed, trying next");
                        last = e;
                    }
                }
            }
            Err(last)
        })
        .await?;
    Ok(cek)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_rpc::{ParamValue, ParameterCollection};

    fn key_row(ordinal: i64, key_id: i64, provider: &str) -> Vec<ParamValue> {
        vec![
            ParamValue::Int(ordinal),
            ParamValue::Int(5),
            ParamValue::Int(key_id),
            ParamValue::Int(1),
            ParamValue::Binary(Bytes::from_static(&[0; 8])),
            ParamValue::Binary(Bytes::from_static(b"wrapped")),
            ParamValue::Text(provider.into()),
            ParamValue::Text("path".into()),
            ParamValue::Text("RSA_OAEP".into()),
        ]
    }

    #[test]
    fn test_read_keys_merges_wrappings() {
        let set = ResultSet::new(["ordinal"])
            .with_row(key_row(1, 10, "A"))
            .with_row(key_row(1, 10, "B"))
            .with_row(key_row(2, 11, "A"));
        let entries = read_keys(&set).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&1].keys().len(), 2);
        assert_eq!(entries[&2].key_id(), 11);
    }

    #[test]
    fn test_read_keys_rejects_conflicting_metadata() {
        let set = ResultSet::new(["ordinal"])
            .with_row(key_row(1, 10, "A"))
            .with_row(key_row(1, 12, "B"));
        let err = read_keys(&set).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_describe_text_for_procedure() {
        let call = Call {
            kind: CommandKind::StoredProcedure,
            text: "dbo.GetOrder".into(),
            params: ParameterCollection::new()
                .with(Parameter::return_value("@ret"))
                .with(Parameter::input("@id", SqlDbType::Int, 7)),
        };
        let mut rpc = RpcRequest::with_capacity(2);
        build_describe(&call, &mut rpc).unwrap();
        assert_eq!(rpc.display_name(), DESCRIBE_PARAMETER_ENCRYPTION);
        let tsql = rpc.param(0).unwrap().param.value.clone().unwrap();
        assert_eq!(tsql.as_str(), Some("EXEC @ret=[dbo].[GetOrder] @id=@id"));
    }

    #[test]
    fn test_describe_declarations_keep_return_value() {
        let call = Call {
            kind: CommandKind::Text,
            text: "SELECT @id".into(),
            params: ParameterCollection::new()
                .with(Parameter::return_value("@ret"))
                .with(Parameter::input("@id", SqlDbType::Int, 7)),
        };
        let mut rpc = RpcRequest::with_capacity(2);
        build_describe(&call, &mut rpc).unwrap();
        let tsql = rpc.param(0).unwrap().param.value.clone().unwrap();
        let declarations = rpc.param(1).unwrap().param.value.clone().unwrap();
        assert_eq!(tsql.as_str(), Some("SELECT @id"));
        assert_eq!(declarations.as_str(), Some("@ret int output,@id int"));
    }

    #[test]
    fn test_split_replies_by_procedure_end() {
        let done = ResponseItem::Done {
            kind: DoneKind::DoneProc,
            row_count: None,
            attention: false,
        };
        let items = vec![
            ResponseItem::ResultSet(ResultSet::new(["a"])),
            ResponseItem::ResultSet(ResultSet::new(["b"])),
            done.clone(),
            ResponseItem::ResultSet(ResultSet::new(["c"])),
            done,
        ];
        let replies = split_replies(items);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].len(), 2);
        assert_eq!(replies[1].len(), 1);
    }
}
