//! RPC model error types.

use thiserror::Error;

/// Errors raised while building RPC requests or declaration lists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// A UDT parameter was declared without a type name.
    #[error("UDT parameter {name} requires a UDT type name")]
    MissingUdtTypeName {
        /// Parameter name.
        name: String,
    },

    /// A non-UDT parameter carries a UDT type name.
    #[error("UDT type name is only valid for UDT parameters (parameter {name})")]
    UnexpectedUdtTypeName {
        /// Parameter name.
        name: String,
    },

    /// A table-valued parameter was declared without a type name.
    #[error("table-valued parameter {name} requires a type name")]
    MissingTypeName {
        /// Parameter name.
        name: String,
    },

    /// Table-valued parameters can only be input parameters.
    #[error("table-valued parameter {name} must have direction Input")]
    TableValuedOutput {
        /// Parameter name.
        name: String,
    },

    /// Table-valued parameters cannot be NULL.
    #[error("table-valued parameter {name} cannot be NULL")]
    TableValuedNull {
        /// Parameter name.
        name: String,
    },

    /// An output parameter of a variable-length type has no size and no value.
    #[error("parameter {index} ({name}) is an output parameter of a variable-length type and needs a size")]
    UninitializedSize {
        /// Position of the parameter in its collection.
        index: usize,
        /// Parameter name.
        name: String,
    },

    /// A multi-part identifier could not be parsed.
    #[error("invalid multi-part identifier: {0}")]
    InvalidIdentifier(String),

    /// Key metadata for the same ordinal disagrees with the first entry recorded.
    #[error(
        "conflicting key metadata for ordinal {ordinal}: expected ({expected_db}, {expected_key}, {expected_version}), got ({db}, {key}, {version})"
    )]
    ConflictingKeyMetadata {
        /// Key ordinal.
        ordinal: u16,
        /// Database id recorded first.
        expected_db: i32,
        /// Key id recorded first.
        expected_key: i32,
        /// Key version recorded first.
        expected_version: i32,
        /// Database id received.
        db: i32,
        /// Key id received.
        key: i32,
        /// Key version received.
        version: i32,
    },

    /// A request slot index is outside the request's parameter count.
    #[error("parameter slot {index} out of range (count {count})")]
    SlotOutOfRange {
        /// Requested index.
        index: usize,
        /// Parameter count of the request.
        count: usize,
    },
}
