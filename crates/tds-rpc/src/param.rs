//! Command parameters.
//!
//! A [`Parameter`] is the caller-facing description of one argument: its
//! name, declared type, direction and value. A [`ParameterCollection`] is the
//! ordered set attached to a command; its shape signature is what decides
//! whether a prepared statement handle is still usable.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use crate::cipher::ParamCipherMetadata;
use crate::error::RpcError;
use crate::types::{
    DEFAULT_NUMERIC_PRECISION, EffectiveType, MAX_SIZE_INDICATOR, SqlDbType, TYPE_SIZE_LIMIT,
};

/// Default fractional-seconds scale for time types.
pub const DEFAULT_VAR_TIME_SCALE: u8 = 7;

/// Direction of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParameterDirection {
    /// Value flows to the server only.
    #[default]
    Input,
    /// Value flows back from the server only.
    Output,
    /// Value flows both ways.
    InputOutput,
    /// Receives the procedure's return status.
    ReturnValue,
}

impl ParameterDirection {
    /// The server writes this parameter back.
    #[must_use]
    pub fn is_output(self) -> bool {
        !matches!(self, Self::Input)
    }

    /// The parameter is passed by reference on the wire.
    #[must_use]
    pub fn is_by_ref(self) -> bool {
        matches!(self, Self::Output | Self::InputOutput)
    }
}

/// A parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any integer type.
    Int(i64),
    /// Any floating point type.
    Float(f64),
    /// Character data.
    Text(String),
    /// Binary data.
    Binary(Bytes),
    /// Rows of a table-valued parameter.
    Table(Vec<Vec<ParamValue>>),
}

impl ParamValue {
    /// Whether this is SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value as text, if it is character data.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an integer, if it is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte length of the value when sent as `db_type`.
    #[must_use]
    pub fn byte_len(&self, db_type: SqlDbType) -> Option<usize> {
        match self {
            Self::Text(s) if db_type.is_size_in_characters() => Some(s.encode_utf16().count() * 2),
            Self::Text(s) => Some(s.len()),
            Self::Binary(b) => Some(b.len()),
            _ => None,
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Bytes> for ParamValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

/// One command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Name, with or without the leading `@`.
    pub name: String,
    /// Declared type.
    pub db_type: SqlDbType,
    /// Direction.
    pub direction: ParameterDirection,
    /// Declared size. `0` means unspecified, `-1` means MAX.
    pub size: i32,
    /// Declared precision for decimals.
    pub precision: Option<u8>,
    /// Declared scale for decimals and time types.
    pub scale: Option<u8>,
    /// Value. `None` means no value was supplied (server default).
    pub value: Option<ParamValue>,
    /// Table type name for table-valued parameters.
    pub type_name: Option<String>,
    /// Type name for UDT parameters.
    pub udt_type_name: Option<String>,
    /// Encryption metadata resolved by a describe round trip.
    pub cipher: Option<ParamCipherMetadata>,
}

impl Parameter {
    /// Create an input parameter without a value.
    pub fn new(name: impl Into<String>, db_type: SqlDbType) -> Self {
        Self {
            name: name.into(),
            db_type,
            direction: ParameterDirection::Input,
            size: 0,
            precision: None,
            scale: None,
            value: None,
            type_name: None,
            udt_type_name: None,
            cipher: None,
        }
    }

    /// Create an input parameter with a value.
    pub fn input(name: impl Into<String>, db_type: SqlDbType, value: impl Into<ParamValue>) -> Self {
        Self::new(name, db_type).with_value(value)
    }

    /// Create a return-value parameter.
    pub fn return_value(name: impl Into<String>) -> Self {
        Self::new(name, SqlDbType::Int).with_direction(ParameterDirection::ReturnValue)
    }

    /// Set the value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<ParamValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the direction.
    #[must_use]
    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Set the declared size.
    #[must_use]
    pub fn with_size(mut self, size: i32) -> Self {
        self.size = size;
        self
    }

    /// Set the declared precision.
    #[must_use]
    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Set the declared scale.
    #[must_use]
    pub fn with_scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Set the table type name.
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Set the UDT type name.
    #[must_use]
    pub fn with_udt_type_name(mut self, udt_type_name: impl Into<String>) -> Self {
        self.udt_type_name = Some(udt_type_name.into());
        self
    }

    /// Name with a guaranteed leading `@`. Empty names stay empty.
    #[must_use]
    pub fn name_fixed(&self) -> String {
        if self.name.is_empty() || self.name.starts_with('@') {
            self.name.clone()
        } else {
            format!("@{}", self.name)
        }
    }

    /// Whether `other` names this parameter, ignoring the `@` prefix and case.
    #[must_use]
    pub fn matches_name(&self, other: &str) -> bool {
        strip_at(&self.name).eq_ignore_ascii_case(strip_at(other))
    }

    /// The value is missing or SQL NULL.
    #[must_use]
    pub fn is_null_or_absent(&self) -> bool {
        self.value.as_ref().is_none_or(ParamValue::is_null)
    }

    /// Byte length of the current value, if it has a length.
    #[must_use]
    pub fn value_byte_len(&self) -> Option<usize> {
        self.value.as_ref().and_then(|v| v.byte_len(self.db_type))
    }

    /// Precision to declare. Zero or unset precision becomes 38.
    #[must_use]
    pub fn actual_precision(&self) -> u8 {
        match self.precision {
            Some(p) if p > 0 => p,
            _ => DEFAULT_NUMERIC_PRECISION,
        }
    }

    /// Scale to declare.
    #[must_use]
    pub fn actual_scale(&self) -> u8 {
        match self.scale {
            Some(s) => s,
            None if self.db_type.is_var_time() => DEFAULT_VAR_TIME_SCALE,
            None => 0,
        }
    }

    /// The type this parameter is actually sent as.
    ///
    /// Variable-length types whose declared or actual size exceeds the
    /// two-byte length limit, or whose size is MAX, are promoted to the MAX
    /// variant of the type.
    #[must_use]
    pub fn effective_type(&self) -> EffectiveType {
        let db_type = self.db_type;
        if !db_type.has_short_length() {
            return EffectiveType::regular(db_type);
        }
        if self.size == MAX_SIZE_INDICATOR {
            return EffectiveType::max(db_type);
        }

        let declared = if db_type.is_size_in_characters() {
            i64::from(self.size) * 2
        } else {
            i64::from(self.size)
        };
        let actual = self
            .value_byte_len()
            .map_or(0, |len| i64::try_from(len).unwrap_or(i64::MAX));

        if declared.max(actual) > i64::from(TYPE_SIZE_LIMIT) {
            EffectiveType::max(db_type)
        } else {
            EffectiveType::regular(db_type)
        }
    }

    /// Validate the parameter before it is rendered or sent.
    ///
    /// `index` is the position in the owning collection, `is_proc` tells
    /// whether the command is a stored procedure call (which does not need a
    /// table type name, the server knows it).
    pub fn validate(&self, index: usize, is_proc: bool) -> Result<(), RpcError> {
        let db_type = self.db_type;

        if self.direction.is_by_ref()
            && self.size == 0
            && !db_type.is_fixed()
            && !db_type.is_var_time()
            && !matches!(
                db_type,
                SqlDbType::Timestamp
                    | SqlDbType::Udt
                    | SqlDbType::Xml
                    | SqlDbType::Decimal
                    | SqlDbType::Structured
            )
            && self.is_null_or_absent()
        {
            return Err(RpcError::UninitializedSize {
                index,
                name: self.name.clone(),
            });
        }

        match db_type {
            SqlDbType::Udt => {
                if self.udt_type_name.as_deref().is_none_or(str::is_empty) {
                    return Err(RpcError::MissingUdtTypeName {
                        name: self.name.clone(),
                    });
                }
            }
            _ if self.udt_type_name.as_deref().is_some_and(|n| !n.is_empty()) => {
                return Err(RpcError::UnexpectedUdtTypeName {
                    name: self.name.clone(),
                });
            }
            _ => {}
        }

        if db_type == SqlDbType::Structured {
            if !is_proc && self.type_name.as_deref().is_none_or(str::is_empty) {
                return Err(RpcError::MissingTypeName {
                    name: self.name.clone(),
                });
            }
            if self.direction != ParameterDirection::Input {
                return Err(RpcError::TableValuedOutput {
                    name: self.name.clone(),
                });
            }
            if matches!(self.value, Some(ParamValue::Null)) {
                return Err(RpcError::TableValuedNull {
                    name: self.name.clone(),
                });
            }
        }

        Ok(())
    }

    fn hash_shape<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.db_type.hash(state);
        self.direction.hash(state);
        self.size.hash(state);
        self.precision.hash(state);
        self.scale.hash(state);
        self.type_name.hash(state);
        self.udt_type_name.hash(state);
        self.effective_type().is_plp.hash(state);
    }
}

fn strip_at(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

/// Ordered parameters of one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterCollection {
    params: Vec<Parameter>,
}

impl ParameterCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn push(&mut self, param: Parameter) {
        self.params.push(param);
    }

    /// Builder-style append.
    #[must_use]
    pub fn with(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    /// Remove every parameter.
    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Parameter] {
        &self.params
    }

    /// Parameters as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    /// Iterate over the parameters.
    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    /// Iterate mutably over the parameters.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Parameter> {
        self.params.iter_mut()
    }

    /// Look up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.matches_name(name))
    }

    /// Look up a parameter by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.matches_name(name))
    }

    /// Position of the parameter with the given name.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.matches_name(name))
    }

    /// The return-value parameter, if any.
    #[must_use]
    pub fn return_value(&self) -> Option<&Parameter> {
        self.params
            .iter()
            .find(|p| p.direction == ParameterDirection::ReturnValue)
    }

    /// Validate every parameter.
    pub fn validate(&self, is_proc: bool) -> Result<(), RpcError> {
        self.params
            .iter()
            .enumerate()
            .try_for_each(|(i, p)| p.validate(i, is_proc))
    }

    /// Hash of everything that affects a parameter declaration.
    ///
    /// Values are excluded except where they can promote a type to MAX.
    #[must_use]
    pub fn shape_signature(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.params.len().hash(&mut hasher);
        for p in &self.params {
            p.hash_shape(&mut hasher);
        }
        hasher.finish()
    }

    /// Drop cipher metadata from every parameter.
    pub fn clear_cipher_metadata(&mut self) {
        for p in &mut self.params {
            p.cipher = None;
        }
    }
}

impl<'a> IntoIterator for &'a ParameterCollection {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

impl FromIterator<Parameter> for ParameterCollection {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<Parameter>> for ParameterCollection {
    fn from(params: Vec<Parameter>) -> Self {
        Self { params }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_name_fixed() {
        assert_eq!(Parameter::new("id", SqlDbType::Int).name_fixed(), "@id");
        assert_eq!(Parameter::new("@id", SqlDbType::Int).name_fixed(), "@id");
        assert_eq!(Parameter::new("", SqlDbType::Int).name_fixed(), "");
    }

    #[test]
    fn test_matches_name_ignores_prefix_and_case() {
        let p = Parameter::new("@OrderId", SqlDbType::Int);
        assert!(p.matches_name("orderid"));
        assert!(p.matches_name("@ORDERID"));
        assert!(!p.matches_name("@order"));
    }

    #[test]
    fn test_effective_type_promotes_large_values() {
        let big = "x".repeat(8001);
        let p = Parameter::input("@s", SqlDbType::VarChar, big.as_str());
        let eff = p.effective_type();
        assert_eq!(eff.db_type, SqlDbType::VarChar);
        assert!(eff.is_plp);

        let wide = "x".repeat(4001);
        let p = Parameter::input("@s", SqlDbType::NChar, wide.as_str());
        let eff = p.effective_type();
        assert_eq!(eff.db_type, SqlDbType::NVarChar);
        assert!(eff.is_plp);
    }

    #[test]
    fn test_effective_type_max_size() {
        let p = Parameter::new("@b", SqlDbType::Binary).with_size(-1);
        let eff = p.effective_type();
        assert_eq!(eff.db_type, SqlDbType::VarBinary);
        assert!(eff.is_plp);
    }

    #[test]
    fn test_effective_type_small_stays_regular() {
        let p = Parameter::input("@s", SqlDbType::NVarChar, "hello").with_size(50);
        let eff = p.effective_type();
        assert_eq!(eff.db_type, SqlDbType::NVarChar);
        assert!(!eff.is_plp);
    }

    #[test]
    fn test_validate_output_without_size() {
        let p = Parameter::new("@out", SqlDbType::NVarChar).with_direction(ParameterDirection::Output);
        assert!(matches!(
            p.validate(3, false),
            Err(RpcError::UninitializedSize { index: 3, .. })
        ));

        let sized = p.clone().with_size(20);
        assert!(sized.validate(3, false).is_ok());

        let fixed = Parameter::new("@n", SqlDbType::Int).with_direction(ParameterDirection::Output);
        assert!(fixed.validate(0, false).is_ok());
    }

    #[test]
    fn test_validate_udt_rules() {
        let p = Parameter::new("@g", SqlDbType::Udt);
        assert!(matches!(
            p.validate(0, false),
            Err(RpcError::MissingUdtTypeName { .. })
        ));
        assert!(p.clone().with_udt_type_name("geography").validate(0, false).is_ok());

        let wrong = Parameter::new("@i", SqlDbType::Int).with_udt_type_name("geography");
        assert!(matches!(
            wrong.validate(0, false),
            Err(RpcError::UnexpectedUdtTypeName { .. })
        ));
    }

    #[test]
    fn test_validate_structured_rules() {
        let rows = ParamValue::Table(vec![vec![ParamValue::Int(1)]]);
        let p = Parameter::input("@t", SqlDbType::Structured, rows.clone());
        assert!(matches!(
            p.validate(0, false),
            Err(RpcError::MissingTypeName { .. })
        ));
        assert!(p.validate(0, true).is_ok());

        let out = Parameter::input("@t", SqlDbType::Structured, rows)
            .with_type_name("dbo.IdList")
            .with_direction(ParameterDirection::InputOutput);
        assert!(matches!(
            out.validate(0, false),
            Err(RpcError::TableValuedOutput { .. })
        ));

        let null = Parameter::input("@t", SqlDbType::Structured, ParamValue::Null)
            .with_type_name("dbo.IdList");
        assert!(matches!(
            null.validate(0, false),
            Err(RpcError::TableValuedNull { .. })
        ));
    }

    #[test]
    fn test_shape_signature_ignores_small_values() {
        let a: ParameterCollection = vec![Parameter::input("@id", SqlDbType::Int, 1)].into();
        let b: ParameterCollection = vec![Parameter::input("@id", SqlDbType::Int, 2)].into();
        assert_eq!(a.shape_signature(), b.shape_signature());

        let c: ParameterCollection = vec![Parameter::input("@id", SqlDbType::BigInt, 2)].into();
        assert_ne!(a.shape_signature(), c.shape_signature());

        let d = a.clone().with(Parameter::input("@x", SqlDbType::Int, 3));
        assert_ne!(a.shape_signature(), d.shape_signature());
    }

    #[test]
    fn test_collection_lookup() {
        let params = ParameterCollection::new()
            .with(Parameter::return_value("@ret"))
            .with(Parameter::input("@id", SqlDbType::Int, 7));
        assert_eq!(params.position("id"), Some(1));
        assert_eq!(params.return_value().unwrap().name, "@ret");
        assert!(params.get("@missing").is_none());
    }
}
