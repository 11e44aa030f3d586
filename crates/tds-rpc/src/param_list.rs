//! Parameter declaration lists.
//!
//! `sp_executesql` and `sp_prepexec` take the parameter declarations as a
//! single string, e.g. `@id int,@name nvarchar(50) output`. This module
//! renders that string and the `EXEC` text used to describe stored procedure
//! parameters for encryption.

use std::fmt::Write as _;

use crate::error::RpcError;
use crate::param::{Parameter, ParameterDirection};
use crate::types::{SqlDbType, TYPE_SIZE_LIMIT};

/// Maximum parts in a table type name (`db.schema.name`).
const MAX_TYPE_NAME_PARTS: usize = 3;
/// Maximum parts in a UDT name (`db.schema.name.assembly`).
const MAX_UDT_NAME_PARTS: usize = 4;

/// Whether a parameter goes on the wire.
///
/// Return-value parameters are only sent when explicitly requested.
#[must_use]
pub fn should_send(param: &Parameter, include_return_value: bool) -> bool {
    include_return_value || param.direction != ParameterDirection::ReturnValue
}

/// Number of parameters that [`should_send`] accepts.
#[must_use]
pub fn sent_param_count(params: &[Parameter], include_return_value: bool) -> usize {
    params
        .iter()
        .filter(|p| should_send(p, include_return_value))
        .count()
}

/// Render the declaration list for a text command.
///
/// Each sent parameter becomes `name type[(size)][ output]`; entries are
/// joined with `,`.
pub fn build_param_list(params: &[Parameter], include_return_value: bool) -> Result<String, RpcError> {
    let mut list = String::new();

    for (index, param) in params.iter().enumerate() {
        param.validate(index, false)?;
        if !should_send(param, include_return_value) {
            continue;
        }
        if !list.is_empty() {
            list.push(',');
        }
        append_declaration(&mut list, param)?;
    }

    Ok(list)
}

fn append_declaration(list: &mut String, param: &Parameter) -> Result<(), RpcError> {
    list.push_str(&param.name_fixed());
    list.push(' ');

    let (db_type, is_plp) = match param.db_type {
        SqlDbType::Udt => {
            let name = param
                .udt_type_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| RpcError::MissingUdtTypeName {
                    name: param.name.clone(),
                })?;
            list.push_str(&quote_multipart(name, MAX_UDT_NAME_PARTS)?);
            (SqlDbType::Udt, true)
        }
        SqlDbType::Structured => {
            let name = param
                .type_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| RpcError::MissingTypeName {
                    name: param.name.clone(),
                })?;
            list.push_str(&quote_multipart(name, MAX_TYPE_NAME_PARTS)?);
            list.push_str(" READONLY");
            (SqlDbType::Structured, false)
        }
        _ => {
            let effective = param.effective_type();
            list.push_str(effective.db_type.type_name());
            (effective.db_type, effective.is_plp)
        }
    };

    if db_type == SqlDbType::Decimal {
        let _ = write!(list, "({},{})", param.actual_precision(), param.actual_scale());
    } else if db_type.is_var_time() {
        let _ = write!(list, "({})", param.actual_scale());
    } else if !is_plp
        && !db_type.is_fixed()
        && !db_type.is_long()
        && !matches!(
            db_type,
            SqlDbType::Timestamp | SqlDbType::Udt | SqlDbType::Structured
        )
    {
        let _ = write!(list, "({})", declared_size(param, db_type));
    } else if is_plp && !matches!(db_type, SqlDbType::Xml | SqlDbType::Udt) {
        list.push_str("(max) ");
    }

    if param.direction != ParameterDirection::Input {
        list.push_str(" output");
    }

    Ok(())
}

/// Size written into a variable-length declaration.
///
/// ANSI types grow to fit the value's byte length; wide types keep the
/// declared size. A zero size becomes the type maximum.
fn declared_size(param: &Parameter, db_type: SqlDbType) -> i32 {
    let mut size = param.size;

    if db_type.is_ansi() {
        if let Some(text) = param.value.as_ref().and_then(|v| v.as_str()) {
            let actual = i32::try_from(text.len()).unwrap_or(i32::MAX);
            if actual > size {
                size = actual;
            }
        }
    }

    if size == 0 {
        size = if db_type.is_size_in_characters() {
            TYPE_SIZE_LIMIT >> 1
        } else {
            TYPE_SIZE_LIMIT
        };
    }
    size
}

/// Bracket-quote each part of a multi-part identifier.
///
/// Parts may already be bracketed or double-quoted; they are unwrapped and
/// re-quoted. `dbo.Orders` becomes `[dbo].[Orders]`.
pub fn quote_identifier(identifier: &str) -> Result<String, RpcError> {
    quote_multipart(identifier, MAX_UDT_NAME_PARTS)
}

fn quote_multipart(identifier: &str, max_parts: usize) -> Result<String, RpcError> {
    let parts = parse_multipart(identifier, max_parts)?;
    let mut out = String::with_capacity(identifier.len() + parts.len() * 2);
    for part in &parts {
        if !out.is_empty() {
            out.push('.');
        }
        if !part.is_empty() {
            out.push('[');
            out.push_str(&part.replace(']', "]]"));
            out.push(']');
        }
    }
    Ok(out)
}

fn parse_multipart(identifier: &str, max_parts: usize) -> Result<Vec<String>, RpcError> {
    let invalid = || RpcError::InvalidIdentifier(identifier.to_string());
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    let mut chars = trimmed.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut part = String::new();
        match chars.peek().copied() {
            Some(open @ ('[' | '"')) => {
                let close = if open == '[' { ']' } else { '"' };
                chars.next();
                loop {
                    match chars.next() {
                        Some(c) if c == close => {
                            if chars.peek() == Some(&close) {
                                chars.next();
                                part.push(close);
                            } else {
                                break;
                            }
                        }
                        Some(c) => part.push(c),
                        None => return Err(invalid()),
                    }
                }
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c == '.' {
                        break;
                    }
                    if c == '[' || c == ']' || c == '"' {
                        return Err(invalid());
                    }
                    part.push(c);
                    chars.next();
                }
                let len = part.trim_end().len();
                part.truncate(len);
            }
        }

        parts.push(part);
        if parts.len() > max_parts {
            return Err(invalid());
        }

        match chars.next() {
            Some('.') => continue,
            None => break,
            Some(_) => return Err(invalid()),
        }
    }

    Ok(parts)
}

/// Build the `EXEC` text that describes a stored procedure call.
///
/// Produces `EXEC [@ret=][proc] @a=@a, @b=@b OUTPUT`. The return-value
/// parameter, when present, receives the procedure's return status.
pub fn build_stored_procedure_statement_for_encryption(
    procedure: &str,
    params: &[Parameter],
) -> Result<String, RpcError> {
    let mut statement = String::from("EXEC ");

    if let Some(ret) = params
        .iter()
        .find(|p| p.direction == ParameterDirection::ReturnValue)
    {
        statement.push_str(&ret.name_fixed());
        statement.push('=');
    }

    statement.push_str(&quote_multipart(procedure, MAX_UDT_NAME_PARTS)?);

    let mut first = true;
    for param in params
        .iter()
        .filter(|p| p.direction != ParameterDirection::ReturnValue)
    {
        statement.push_str(if first { " " } else { ", " });
        first = false;
        let name = param.name_fixed();
        statement.push_str(&name);
        statement.push('=');
        statement.push_str(&name);
        if param.direction.is_by_ref() {
            statement.push_str(" OUTPUT");
        }
    }

    Ok(statement)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::param::ParamValue;

    #[test]
    fn test_simple_list() {
        let params = vec![
            Parameter::input("@id", SqlDbType::Int, 1),
            Parameter::input("name", SqlDbType::NVarChar, "bob").with_size(50),
        ];
        assert_eq!(
            build_param_list(&params, false).unwrap(),
            "@id int,@name nvarchar(50)"
        );
    }

    #[test]
    fn test_decimal_and_time() {
        let params = vec![
            Parameter::new("@d", SqlDbType::Decimal).with_scale(2),
            Parameter::new("@e", SqlDbType::Decimal).with_precision(10).with_scale(4),
            Parameter::new("@t", SqlDbType::DateTime2),
            Parameter::new("@o", SqlDbType::Time).with_scale(3),
        ];
        assert_eq!(
            build_param_list(&params, false).unwrap(),
            "@d decimal(38,2),@e decimal(10,4),@t datetime2(7),@o time(3)"
        );
    }

    #[test]
    fn test_zero_size_defaults() {
        let params = vec![
            Parameter::new("@w", SqlDbType::NVarChar),
            Parameter::new("@b", SqlDbType::VarBinary),
            Parameter::new("@a", SqlDbType::VarChar),
        ];
        assert_eq!(
            build_param_list(&params, false).unwrap(),
            "@w nvarchar(4000),@b varbinary(8000),@a varchar(8000)"
        );
    }

    #[test]
    fn test_ansi_size_grows_to_value_but_wide_does_not() {
        let params = vec![
            Parameter::input("@a", SqlDbType::VarChar, "hello world").with_size(5),
            Parameter::input("@w", SqlDbType::NVarChar, "hello world").with_size(5),
        ];
        assert_eq!(
            build_param_list(&params, false).unwrap(),
            "@a varchar(11),@w nvarchar(5)"
        );
    }

    #[test]
    fn test_max_and_output() {
        let params = vec![
            Parameter::new("@doc", SqlDbType::NVarChar)
                .with_size(-1)
                .with_direction(ParameterDirection::Output),
            Parameter::new("@x", SqlDbType::Xml),
        ];
        assert_eq!(
            build_param_list(&params, false).unwrap(),
            "@doc nvarchar(max)  output,@x xml"
        );
    }

    #[test]
    fn test_structured_and_udt() {
        let rows = ParamValue::Table(vec![]);
        let params = vec![
            Parameter::input("@ids", SqlDbType::Structured, rows).with_type_name("dbo.IdList"),
            Parameter::new("@g", SqlDbType::Udt).with_udt_type_name("geography"),
        ];
        assert_eq!(
            build_param_list(&params, false).unwrap(),
            "@ids [dbo].[IdList] READONLY,@g [geography]"
        );
    }

    #[test]
    fn test_missing_type_name_is_error() {
        let params = vec![Parameter::input(
            "@ids",
            SqlDbType::Structured,
            ParamValue::Table(vec![]),
        )];
        assert!(matches!(
            build_param_list(&params, false),
            Err(RpcError::MissingTypeName { .. })
        ));
    }

    #[test]
    fn test_return_value_excluded_by_default() {
        let params = vec![
            Parameter::return_value("@ret"),
            Parameter::input("@id", SqlDbType::Int, 7),
        ];
        assert_eq!(build_param_list(&params, false).unwrap(), "@id int");
        assert_eq!(
            build_param_list(&params, true).unwrap(),
            "@ret int output,@id int"
        );
        assert_eq!(sent_param_count(&params, false), 1);
        assert_eq!(sent_param_count(&params, true), 2);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("dbo.Orders").unwrap(), "[dbo].[Orders]");
        assert_eq!(quote_identifier("[dbo].[My]]Proc]").unwrap(), "[dbo].[My]]Proc]");
        assert_eq!(quote_identifier("\"s\".t").unwrap(), "[s].[t]");
        assert_eq!(quote_identifier("db..t").unwrap(), "[db]..[t]");
        assert!(quote_identifier("[unterminated").is_err());
        assert!(quote_identifier("a.b.c.d.e").is_err());
        assert!(quote_identifier("  ").is_err());
    }

    #[test]
    fn test_stored_procedure_statement() {
        let params = vec![
            Parameter::return_value("@ret"),
            Parameter::input("@id", SqlDbType::Int, 7),
            Parameter::new("@total", SqlDbType::Int).with_direction(ParameterDirection::Output),
        ];
        assert_eq!(
            build_stored_procedure_statement_for_encryption("dbo.GetOrder", &params).unwrap(),
            "EXEC @ret=[dbo].[GetOrder] @id=@id, @total=@total OUTPUT"
        );
        assert_eq!(
            build_stored_procedure_statement_for_encryption("p", &[]).unwrap(),
            "EXEC [p]"
        );
    }
}
