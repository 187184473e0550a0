//! Field values and field tables

use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use bytes::Bytes;
use indexmap::IndexMap;

mod codec;
pub use codec::*;

/// A decimal value: `value * 10^-scale`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Decimal {
    /// Number of decimal digits
    pub scale: u8,

    /// Unscaled value
    pub value: u32,
}

/// A value that can be carried in a field table or a field array
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// `t`
    Bool(bool),

    /// `b`
    I8(i8),

    /// `B`
    U8(u8),

    /// `s`
    I16(i16),

    /// `u`
    U16(u16),

    /// `I`
    I32(i32),

    /// `i`
    U32(u32),

    /// `l`
    I64(i64),

    /// `f`
    F32(f32),

    /// `d`
    F64(f64),

    /// `D`
    Decimal(Decimal),

    /// Short string. Only used for method arguments; never written into a table
    /// as the RabbitMQ and Qpid brokers disagree on its tag
    ShortStr(String),

    /// `S`
    LongStr(Bytes),

    /// `A`
    Array(Vec<Value>),

    /// `T`, seconds since the unix epoch
    Timestamp(u64),

    /// `F`
    Table(FieldTable),

    /// `x`
    ByteArray(Bytes),

    /// `V`
    Void,
}

impl Value {
    /// Name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Decimal(_) => "decimal",
            Value::ShortStr(_) => "short string",
            Value::LongStr(_) => "long string",
            Value::Array(_) => "array",
            Value::Timestamp(_) => "timestamp",
            Value::Table(_) => "table",
            Value::ByteArray(_) => "byte array",
            Value::Void => "void",
        }
    }

    /// Returns the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns any integer variant widened to `i128`
    pub fn as_integer(&self) -> Option<i128> {
        let val = match self {
            Value::I8(v) => *v as i128,
            Value::U8(v) => *v as i128,
            Value::I16(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::U32(v) => *v as i128,
            Value::I64(v) => *v as i128,
            Value::Timestamp(v) => *v as i128,
            _ => return None,
        };
        Some(val)
    }

    /// Returns the value as an unsigned integer if it is a non-negative integer
    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|v| u64::try_from(v).ok())
    }

    /// Returns the value as a string slice if it is a short string or a UTF-8 long string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::ShortStr(s) => Some(s),
            Value::LongStr(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a string or byte array
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ShortStr(s) => Some(s.as_bytes()),
            Value::LongStr(b) | Value::ByteArray(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the nested table
    pub fn as_table(&self) -> Option<&FieldTable> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}e-{}", d.value, d.scale),
            Value::ShortStr(s) => write!(f, "{:?}", s),
            Value::LongStr(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{:?}", s),
                Err(_) => write!(f, "{:?}", b),
            },
            Value::Array(a) => f.debug_list().entries(a.iter().map(ToString::to_string)).finish(),
            Value::Timestamp(t) => write!(f, "@{}", t),
            Value::Table(t) => write!(f, "{:?}", t),
            Value::ByteArray(b) => write!(f, "{:?}", b),
            Value::Void => write!(f, "void"),
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_value! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    Decimal => Decimal,
    Bytes => LongStr,
    Vec<Value> => Array,
    FieldTable => Table,
}

impl From<u64> for Value {
    /// `u64` has no tag of its own in the table encoding; values above `i64::MAX`
    /// are only usable as method arguments of type `longlong`
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => Value::I64(v),
            Err(_) => Value::Timestamp(value),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::LongStr(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::LongStr(Bytes::from(value))
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::from(value.as_str())
    }
}

/// An ordered mapping from field name to [`Value`].
///
/// Used for field tables, method arguments and content properties. Insertion
/// order is kept so that tables round-trip byte for byte.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldTable(IndexMap<String, Value>);

/// Arguments of a method
pub type Arguments = FieldTable;

impl FieldTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Inserts a field and returns the table, for chaining
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Returns a boolean field
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// Returns a non-negative integer field of any width
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(Value::as_u64)
    }

    /// Returns a string field
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Returns a nested table
    pub fn get_table(&self, name: &str) -> Option<&FieldTable> {
        self.0.get(name).and_then(Value::as_table)
    }

    /// Consumes the wrapper
    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.0
    }
}

impl Deref for FieldTable {
    type Target = IndexMap<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FieldTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<IndexMap<String, Value>> for FieldTable {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K, V> FromIterator<(K, V)> for FieldTable
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for FieldTable {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
