//! SQL type metadata used when declaring RPC parameters.
//!
//! Each [`SqlDbType`] carries the handful of properties that drive the
//! declaration grammar: whether the type has a fixed length, whether it is a
//! legacy LOB, whether its size is counted in characters and so on.

/// Largest byte size a non-MAX variable-length type can declare.
pub const TYPE_SIZE_LIMIT: i32 = 8000;

/// Size value meaning "MAX".
pub const MAX_SIZE_INDICATOR: i32 = -1;

/// Default numeric precision when a decimal parameter specifies none.
pub const DEFAULT_NUMERIC_PRECISION: u8 = 38;

/// SQL Server data types a parameter can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDbType {
    /// `bigint`
    BigInt,
    /// `binary(n)`
    Binary,
    /// `bit`
    Bit,
    /// `char(n)`
    Char,
    /// `date`
    Date,
    /// `datetime`
    DateTime,
    /// `datetime2(s)`
    DateTime2,
    /// `datetimeoffset(s)`
    DateTimeOffset,
    /// `decimal(p,s)`
    Decimal,
    /// `float`
    Float,
    /// `image`
    Image,
    /// `int`
    Int,
    /// `money`
    Money,
    /// `nchar(n)`
    NChar,
    /// `ntext`
    NText,
    /// `nvarchar(n)`
    NVarChar,
    /// `real`
    Real,
    /// `smalldatetime`
    SmallDateTime,
    /// `smallint`
    SmallInt,
    /// `smallmoney`
    SmallMoney,
    /// Table-valued parameter.
    Structured,
    /// `text`
    Text,
    /// `time(s)`
    Time,
    /// `timestamp` / `rowversion`
    Timestamp,
    /// `tinyint`
    TinyInt,
    /// CLR user-defined type.
    Udt,
    /// `uniqueidentifier`
    UniqueIdentifier,
    /// `varbinary(n)`
    VarBinary,
    /// `varchar(n)`
    VarChar,
    /// `sql_variant`
    Variant,
    /// `xml`
    Xml,
}

impl SqlDbType {
    /// Type name as written in a declaration.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::BigInt => "bigint",
            Self::Binary => "binary",
            Self::Bit => "bit",
            Self::Char => "char",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::DateTime2 => "datetime2",
            Self::DateTimeOffset => "datetimeoffset",
            Self::Decimal => "decimal",
            Self::Float => "float",
            Self::Image => "image",
            Self::Int => "int",
            Self::Money => "money",
            Self::NChar => "nchar",
            Self::NText => "ntext",
            Self::NVarChar => "nvarchar",
            Self::Real => "real",
            Self::SmallDateTime => "smalldatetime",
            Self::SmallInt => "smallint",
            Self::SmallMoney => "smallmoney",
            Self::Structured => "table",
            Self::Text => "text",
            Self::Time => "time",
            Self::Timestamp => "timestamp",
            Self::TinyInt => "tinyint",
            Self::Udt => "udt",
            Self::UniqueIdentifier => "uniqueidentifier",
            Self::VarBinary => "varbinary",
            Self::VarChar => "varchar",
            Self::Variant => "sql_variant",
            Self::Xml => "xml",
        }
    }

    /// Fixed-length types never render a size suffix.
    #[must_use]
    pub fn is_fixed(self) -> bool {
        matches!(
            self,
            Self::BigInt
                | Self::Bit
                | Self::Date
                | Self::DateTime
                | Self::Float
                | Self::Int
                | Self::Money
                | Self::Real
                | Self::SmallDateTime
                | Self::SmallInt
                | Self::SmallMoney
                | Self::TinyInt
                | Self::UniqueIdentifier
                | Self::Variant
        )
    }

    /// Legacy LOB and streamed types (`text`, `ntext`, `image`, `xml`, udt).
    #[must_use]
    pub fn is_long(self) -> bool {
        matches!(
            self,
            Self::Text | Self::NText | Self::Image | Self::Xml | Self::Udt
        )
    }

    /// Types declared with a fractional-seconds scale.
    #[must_use]
    pub fn is_var_time(self) -> bool {
        matches!(self, Self::Time | Self::DateTime2 | Self::DateTimeOffset)
    }

    /// Single-byte character types.
    #[must_use]
    pub fn is_ansi(self) -> bool {
        matches!(self, Self::Char | Self::VarChar | Self::Text)
    }

    /// UTF-16 character types.
    #[must_use]
    pub fn is_nchar(self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }

    /// Types whose declared size counts characters rather than bytes.
    #[must_use]
    pub fn is_size_in_characters(self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText | Self::Xml)
    }

    /// Types that are always sent as partially length-prefixed streams.
    #[must_use]
    pub fn is_always_plp(self) -> bool {
        matches!(self, Self::Xml | Self::Udt)
    }

    /// Variable-length type with a two-byte length prefix (the ones that can
    /// be promoted to MAX).
    #[must_use]
    pub fn has_short_length(self) -> bool {
        !self.is_fixed()
            && !self.is_long()
            && !self.is_var_time()
            && !matches!(self, Self::Decimal | Self::Structured | Self::Timestamp)
    }

    /// The MAX-capable type this type promotes to when its size no longer
    /// fits a two-byte length.
    #[must_use]
    pub fn max_type(self) -> Self {
        match self {
            Self::Char | Self::VarChar => Self::VarChar,
            Self::NChar | Self::NVarChar => Self::NVarChar,
            Self::Binary | Self::VarBinary => Self::VarBinary,
            other => other,
        }
    }
}

/// A parameter's type after length validation.
///
/// Oversized or explicitly MAX variable-length parameters are promoted to
/// their MAX type, which is streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveType {
    /// The declared (possibly promoted) type.
    pub db_type: SqlDbType,
    /// The type is sent as a partially length-prefixed stream.
    pub is_plp: bool,
}

impl EffectiveType {
    /// A type sent with its regular length prefix.
    #[must_use]
    pub fn regular(db_type: SqlDbType) -> Self {
        Self {
            db_type,
            is_plp: db_type.is_always_plp(),
        }
    }

    /// A type promoted to MAX.
    #[must_use]
    pub fn max(db_type: SqlDbType) -> Self {
        Self {
            db_type: db_type.max_type(),
            is_plp: true,
        }
    }
}
