//! Methods, their wire layout and the lookup table that describes them

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{DecodeError, EncodeError},
    primitives::{
        ensure, read_long_str, read_short_str, read_table, write_long_str, write_short_str,
        write_table, Arguments, FieldTable, Value,
    },
};

/// Identifies a method by its class id and method id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    /// Class id
    pub class_id: u16,

    /// Method id within the class
    pub method_id: u16,
}

impl MethodId {
    /// Creates a new method id
    pub const fn new(class_id: u16, method_id: u16) -> Self {
        Self {
            class_id,
            method_id,
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.class_id, self.method_id)
    }
}

/// Wire type of a method argument or a content property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single bit, consecutive bits are packed into octets
    Bit,
    /// 8-bit unsigned
    Octet,
    /// 16-bit unsigned
    Short,
    /// 32-bit unsigned
    Long,
    /// 64-bit unsigned
    LongLong,
    /// String of at most 255 bytes
    ShortStr,
    /// Binary string with 32-bit length
    LongStr,
    /// 64-bit POSIX time
    Timestamp,
    /// Field table
    Table,
}

impl FieldKind {
    fn default_value(&self) -> Value {
        match self {
            FieldKind::Bit => Value::Bool(false),
            FieldKind::Octet => Value::U8(0),
            FieldKind::Short => Value::U16(0),
            FieldKind::Long => Value::U32(0),
            FieldKind::LongLong => Value::Timestamp(0),
            FieldKind::ShortStr => Value::ShortStr(String::new()),
            FieldKind::LongStr => Value::LongStr(Bytes::new()),
            FieldKind::Timestamp => Value::Timestamp(0),
            FieldKind::Table => Value::Table(FieldTable::new()),
        }
    }
}

/// Name and wire type of a single argument or property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name, lower case with `-` separators
    pub name: &'static str,

    /// Wire type
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Creates a new field spec
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Describes a single method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    /// Dotted name, eg. `"queue.declare"`
    pub name: &'static str,

    /// Class id and method id
    pub id: MethodId,

    /// Whether the sender expects one of `responses` in return
    pub synchronous: bool,

    /// Method ids (in the same class) that answer this method
    pub responses: &'static [u16],

    /// Whether the method is followed by a content header and body
    pub content: bool,

    /// Argument layout in wire order
    pub fields: &'static [FieldSpec],
}

impl MethodSpec {
    /// Whether `id` answers this method
    pub fn is_response(&self, id: MethodId) -> bool {
        id.class_id == self.id.class_id && self.responses.contains(&id.method_id)
    }

    /// Ids of the methods that answer this method
    pub fn response_ids(&self) -> Vec<MethodId> {
        self.responses
            .iter()
            .map(|m| MethodId::new(self.id.class_id, *m))
            .collect()
    }

    /// Looks up an argument by name
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A read-only lookup from method ids and names to wire layouts.
///
/// The frame codec and the engine never hardcode argument layouts; everything goes
/// through this table.
pub trait MethodTable: fmt::Debug + Send + Sync {
    /// Looks up a method by id
    fn method(&self, id: MethodId) -> Option<&MethodSpec>;

    /// Looks up a method by its dotted name, eg. `"basic.publish"`
    fn method_by_name(&self, name: &str) -> Option<&MethodSpec>;

    /// Property layout of the content class, in flag order
    fn properties(&self, class_id: u16) -> Option<&[FieldSpec]>;
}

/// A method together with its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    /// Class id and method id
    pub id: MethodId,

    /// Arguments keyed by field name
    pub arguments: Arguments,
}

impl Method {
    /// Creates a new method
    pub fn new(id: MethodId, arguments: Arguments) -> Self {
        Self { id, arguments }
    }

    /// Creates a method from its spec, normalizing `_` in argument names to `-` and
    /// rejecting arguments the method does not define
    pub fn from_spec(spec: &MethodSpec, arguments: Arguments) -> Result<Self, EncodeError> {
        let mut normalized = FieldTable::new();
        for (name, value) in arguments {
            let name = name.replace('_', "-");
            if spec.field(&name).is_none() {
                return Err(EncodeError::UnknownArgument {
                    method: spec.name,
                    field: name,
                });
            }
            normalized.insert(name, value);
        }
        Ok(Self::new(spec.id, normalized))
    }

    /// Whether this method has the given id
    pub fn is(&self, id: MethodId) -> bool {
        self.id == id
    }

    /// Writes class id, method id and arguments
    pub fn encode(&self, table: &dyn MethodTable, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let spec = table
            .method(self.id)
            .ok_or(EncodeError::UnknownMethod(self.id))?;
        dst.put_u16(self.id.class_id);
        dst.put_u16(self.id.method_id);
        encode_arguments(spec.fields, &self.arguments, dst)
    }

    /// Reads class id, method id and arguments. The whole of `src` must be consumed.
    pub fn decode<B: Buf>(table: &dyn MethodTable, src: &mut B) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        let id = MethodId::new(src.get_u16(), src.get_u16());
        let spec = table.method(id).ok_or(DecodeError::UnknownMethod(id))?;
        let arguments = decode_arguments(spec.fields, src)?;
        match src.remaining() {
            0 => Ok(Self { id, arguments }),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

fn coerce_integer(
    field: &FieldSpec,
    value: &Value,
    max: u128,
) -> Result<u64, EncodeError> {
    let int = value.as_integer().ok_or_else(|| EncodeError::TypeMismatch {
        field: field.name.to_string(),
        expected: field.kind,
        found: value.kind(),
    })?;
    if int < 0 || int as u128 > max {
        return Err(EncodeError::OutOfRange {
            field: field.name.to_string(),
            expected: field.kind,
            value: int,
        });
    }
    Ok(int as u64)
}

fn mismatch(field: &FieldSpec, value: &Value) -> EncodeError {
    EncodeError::TypeMismatch {
        field: field.name.to_string(),
        expected: field.kind,
        found: value.kind(),
    }
}

/// Writes a single field. Bits written here occupy a whole octet.
fn encode_field(field: &FieldSpec, value: &Value, dst: &mut BytesMut) -> Result<(), EncodeError> {
    match field.kind {
        FieldKind::Bit => {
            let b = value.as_bool().ok_or_else(|| mismatch(field, value))?;
            dst.put_u8(b as u8);
        }
        FieldKind::Octet => dst.put_u8(coerce_integer(field, value, u8::MAX as u128)? as u8),
        FieldKind::Short => dst.put_u16(coerce_integer(field, value, u16::MAX as u128)? as u16),
        FieldKind::Long => dst.put_u32(coerce_integer(field, value, u32::MAX as u128)? as u32),
        FieldKind::LongLong | FieldKind::Timestamp => {
            dst.put_u64(coerce_integer(field, value, u64::MAX as u128)?)
        }
        FieldKind::ShortStr => {
            let s = value.as_str().ok_or_else(|| mismatch(field, value))?;
            write_short_str(dst, s)?;
        }
        FieldKind::LongStr => {
            let b = value.as_bytes().ok_or_else(|| mismatch(field, value))?;
            write_long_str(dst, b);
        }
        FieldKind::Table => {
            let t = value.as_table().ok_or_else(|| mismatch(field, value))?;
            write_table(dst, t)?;
        }
    }
    Ok(())
}

fn decode_field<B: Buf>(kind: FieldKind, src: &mut B) -> Result<Value, DecodeError> {
    let value = match kind {
        FieldKind::Bit => {
            ensure(src, 1)?;
            Value::Bool(src.get_u8() != 0)
        }
        FieldKind::Octet => {
            ensure(src, 1)?;
            Value::U8(src.get_u8())
        }
        FieldKind::Short => {
            ensure(src, 2)?;
            Value::U16(src.get_u16())
        }
        FieldKind::Long => {
            ensure(src, 4)?;
            Value::U32(src.get_u32())
        }
        FieldKind::LongLong | FieldKind::Timestamp => {
            ensure(src, 8)?;
            Value::Timestamp(src.get_u64())
        }
        FieldKind::ShortStr => Value::ShortStr(read_short_str(src)?),
        FieldKind::LongStr => Value::LongStr(read_long_str(src)?),
        FieldKind::Table => Value::Table(read_table(src)?),
    };
    Ok(value)
}

/// Writes arguments in the order given by `fields`. Missing arguments are written
/// as the zero value of their type. Consecutive bits share an octet, least
/// significant bit first.
pub fn encode_arguments(
    fields: &[FieldSpec],
    arguments: &Arguments,
    dst: &mut BytesMut,
) -> Result<(), EncodeError> {
    let mut bits: Option<(u8, u8)> = None;

    for field in fields {
        let default;
        let value = match arguments.get(field.name) {
            Some(value) => value,
            None => {
                default = field.kind.default_value();
                &default
            }
        };

        if let FieldKind::Bit = field.kind {
            let bit = value.as_bool().ok_or_else(|| mismatch(field, value))?;
            let (mut octet, count) = bits.unwrap_or((0, 0));
            if bit {
                octet |= 1 << count;
            }
            bits = match count + 1 {
                8 => {
                    dst.put_u8(octet);
                    None
                }
                n => Some((octet, n)),
            };
            continue;
        }

        if let Some((octet, _)) = bits.take() {
            dst.put_u8(octet);
        }
        encode_field(field, value, dst)?;
    }

    if let Some((octet, _)) = bits {
        dst.put_u8(octet);
    }
    Ok(())
}

/// Reads arguments in the order given by `fields`
pub fn decode_arguments<B: Buf>(fields: &[FieldSpec], src: &mut B) -> Result<Arguments, DecodeError> {
    let mut arguments = Arguments::new();
    let mut bits: Option<(u8, u8)> = None;

    for field in fields {
        if let FieldKind::Bit = field.kind {
            let (octet, count) = match bits {
                Some(state) => state,
                None => {
                    ensure(src, 1)?;
                    (src.get_u8(), 0)
                }
            };
            arguments.insert(field.name.to_string(), Value::Bool(octet & (1 << count) != 0));
            bits = match count + 1 {
                8 => None,
                n => Some((octet, n)),
            };
            continue;
        }

        bits = None;
        let value = decode_field(field.kind, src)?;
        arguments.insert(field.name.to_string(), value);
    }
    Ok(arguments)
}

/// Writes the property flags followed by the present properties.
///
/// Each flag word holds 15 flags from the most significant bit down; bit 0 marks
/// that another flag word follows.
pub fn encode_properties(
    fields: &[FieldSpec],
    properties: &FieldTable,
    dst: &mut BytesMut,
) -> Result<(), EncodeError> {
    let present: Vec<bool> = fields
        .iter()
        .map(|f| properties.contains_key(f.name))
        .collect();
    let groups = present.chunks(15).collect::<Vec<_>>();
    let last_set = groups.iter().rposition(|g| g.iter().any(|p| *p)).unwrap_or(0);

    for (i, group) in groups.iter().enumerate().take(last_set + 1) {
        let mut word = 0u16;
        for (j, p) in group.iter().enumerate() {
            if *p {
                word |= 1 << (15 - j);
            }
        }
        if i < last_set {
            word |= 1;
        }
        dst.put_u16(word);
    }
    if groups.is_empty() {
        dst.put_u16(0);
    }

    for field in fields {
        if let Some(value) = properties.get(field.name) {
            match field.kind {
                FieldKind::Bit => {
                    // A present bit property is fully described by its flag
                    value.as_bool().ok_or_else(|| mismatch(field, value))?;
                }
                _ => encode_field(field, value, dst)?,
            }
        }
    }
    Ok(())
}

/// Reads the property flags and the present properties
pub fn decode_properties<B: Buf>(fields: &[FieldSpec], src: &mut B) -> Result<FieldTable, DecodeError> {
    let mut present = Vec::with_capacity(fields.len());
    loop {
        ensure(src, 2)?;
        let word = src.get_u16();
        for j in 0..15 {
            present.push(word & (1 << (15 - j)) != 0);
        }
        if word & 1 == 0 {
            break;
        }
    }

    let mut properties = FieldTable::new();
    for (field, p) in fields.iter().zip(present) {
        if !p {
            continue;
        }
        let value = match field.kind {
            FieldKind::Bit => Value::Bool(true),
            kind => decode_field(kind, src)?,
        };
        properties.insert(field.name.to_string(), value);
    }
    Ok(properties)
}
