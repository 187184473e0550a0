//! Errors raised while encoding or decoding AMQP 0-9-1 primitives

use crate::method::{FieldKind, MethodId};

/// Error encoding a value, a method or a content header
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    /// A short string must not exceed 255 bytes
    #[error("Short string of {0} bytes exceeds 255 bytes")]
    ShortStringTooLong(usize),

    /// The value supplied for a field cannot be written as the field's type
    #[error("Field {field:?} expects {expected:?}, found {found}")]
    TypeMismatch {
        /// Name of the field
        field: String,
        /// Wire type of the field
        expected: FieldKind,
        /// Kind of the supplied value
        found: &'static str,
    },

    /// An integer does not fit into the field's wire type
    #[error("Value {value} of field {field:?} does not fit in {expected:?}")]
    OutOfRange {
        /// Name of the field
        field: String,
        /// Wire type of the field
        expected: FieldKind,
        /// The supplied value
        value: i128,
    },

    /// An argument was supplied that the method does not define
    #[error("Method {method} has no argument named {field:?}")]
    UnknownArgument {
        /// Name of the method
        method: &'static str,
        /// Name of the supplied argument
        field: String,
    },

    /// The method is not found in the method table
    #[error("Unknown method {0}")]
    UnknownMethod(MethodId),

    /// No property layout is known for the content class
    #[error("Unknown content class {0}")]
    UnknownClass(u16),
}

/// Error decoding a value, a method or a content header
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// The input ended before the value was complete
    #[error("Unexpected end of input, {needed} more bytes needed")]
    Incomplete {
        /// Number of missing bytes
        needed: usize,
    },

    /// A short string is not valid UTF-8
    #[error("Short string is not valid UTF-8")]
    InvalidUtf8,

    /// A field-table value carries a type tag that is not supported
    #[error("Unknown field value tag {0:#04x}")]
    UnknownValueTag(u8),

    /// The method is not found in the method table
    #[error("Unknown method {0}")]
    UnknownMethod(MethodId),

    /// No property layout is known for the content class
    #[error("Unknown content class {0}")]
    UnknownClass(u16),

    /// Bytes remained after all declared fields were read
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
}
