//! Wire encoding of strings, field tables and field values.
//!
//! Integers are big-endian. Tables and arrays carry a 32-bit byte length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};

use super::{Decimal, FieldTable, Value};

pub(crate) fn ensure<B: Buf>(src: &B, n: usize) -> Result<(), DecodeError> {
    match src.remaining() {
        r if r >= n => Ok(()),
        r => Err(DecodeError::Incomplete { needed: n - r }),
    }
}

/// Writes a `u32` length prefix followed by whatever `f` writes
pub(crate) fn with_length_prefix<F>(dst: &mut BytesMut, f: F) -> Result<(), EncodeError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), EncodeError>,
{
    let start = dst.len();
    dst.put_u32(0);
    f(dst)?;
    let len = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Writes a short string (8-bit length prefix)
pub fn write_short_str(dst: &mut BytesMut, value: &str) -> Result<(), EncodeError> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(EncodeError::ShortStringTooLong(len));
    }
    dst.put_u8(len as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

/// Reads a short string (8-bit length prefix)
pub fn read_short_str<B: Buf>(src: &mut B) -> Result<String, DecodeError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    ensure(src, len)?;
    let bytes = src.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

/// Writes a long string (32-bit length prefix)
pub fn write_long_str(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

/// Reads a long string (32-bit length prefix)
pub fn read_long_str<B: Buf>(src: &mut B) -> Result<Bytes, DecodeError> {
    ensure(src, 4)?;
    let len = src.get_u32() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Writes a field table including its length prefix
pub fn write_table(dst: &mut BytesMut, table: &FieldTable) -> Result<(), EncodeError> {
    with_length_prefix(dst, |dst| {
        for (name, value) in table.iter() {
            write_short_str(dst, name)?;
            write_value(dst, value)?;
        }
        Ok(())
    })
}

/// Reads a field table including its length prefix
pub fn read_table<B: Buf>(src: &mut B) -> Result<FieldTable, DecodeError> {
    let mut inner = read_long_str(src)?;
    let mut table = FieldTable::new();
    while inner.has_remaining() {
        let name = read_short_str(&mut inner)?;
        let value = read_value(&mut inner)?;
        table.insert(name, value);
    }
    Ok(table)
}

fn write_array(dst: &mut BytesMut, values: &[Value]) -> Result<(), EncodeError> {
    with_length_prefix(dst, |dst| {
        for value in values {
            write_value(dst, value)?;
        }
        Ok(())
    })
}

fn read_array<B: Buf>(src: &mut B) -> Result<Vec<Value>, DecodeError> {
    let mut inner = read_long_str(src)?;
    let mut values = Vec::new();
    while inner.has_remaining() {
        values.push(read_value(&mut inner)?);
    }
    Ok(values)
}

/// Writes a tagged field value
pub fn write_value(dst: &mut BytesMut, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Bool(v) => {
            dst.put_u8(b't');
            dst.put_u8(*v as u8);
        }
        Value::I8(v) => {
            dst.put_u8(b'b');
            dst.put_i8(*v);
        }
        Value::U8(v) => {
            dst.put_u8(b'B');
            dst.put_u8(*v);
        }
        Value::I16(v) => {
            dst.put_u8(b's');
            dst.put_i16(*v);
        }
        Value::U16(v) => {
            dst.put_u8(b'u');
            dst.put_u16(*v);
        }
        Value::I32(v) => {
            dst.put_u8(b'I');
            dst.put_i32(*v);
        }
        Value::U32(v) => {
            dst.put_u8(b'i');
            dst.put_u32(*v);
        }
        Value::I64(v) => {
            dst.put_u8(b'l');
            dst.put_i64(*v);
        }
        Value::F32(v) => {
            dst.put_u8(b'f');
            dst.put_f32(*v);
        }
        Value::F64(v) => {
            dst.put_u8(b'd');
            dst.put_f64(*v);
        }
        Value::Decimal(d) => {
            dst.put_u8(b'D');
            dst.put_u8(d.scale);
            dst.put_u32(d.value);
        }
        Value::ShortStr(s) => {
            dst.put_u8(b'S');
            write_long_str(dst, s.as_bytes());
        }
        Value::LongStr(b) => {
            dst.put_u8(b'S');
            write_long_str(dst, b);
        }
        Value::Array(values) => {
            dst.put_u8(b'A');
            write_array(dst, values)?;
        }
        Value::Timestamp(t) => {
            dst.put_u8(b'T');
            dst.put_u64(*t);
        }
        Value::Table(t) => {
            dst.put_u8(b'F');
            write_table(dst, t)?;
        }
        Value::ByteArray(b) => {
            dst.put_u8(b'x');
            write_long_str(dst, b);
        }
        Value::Void => dst.put_u8(b'V'),
    }
    Ok(())
}

/// Reads a tagged field value
pub fn read_value<B: Buf>(src: &mut B) -> Result<Value, DecodeError> {
    ensure(src, 1)?;
    let tag = src.get_u8();
    let value = match tag {
        b't' => {
            ensure(src, 1)?;
            Value::Bool(src.get_u8() != 0)
        }
        b'b' => {
            ensure(src, 1)?;
            Value::I8(src.get_i8())
        }
        b'B' => {
            ensure(src, 1)?;
            Value::U8(src.get_u8())
        }
        b's' => {
            ensure(src, 2)?;
            Value::I16(src.get_i16())
        }
        b'u' => {
            ensure(src, 2)?;
            Value::U16(src.get_u16())
        }
        b'I' => {
            ensure(src, 4)?;
            Value::I32(src.get_i32())
        }
        b'i' => {
            ensure(src, 4)?;
            Value::U32(src.get_u32())
        }
        b'l' => {
            ensure(src, 8)?;
            Value::I64(src.get_i64())
        }
        b'f' => {
            ensure(src, 4)?;
            Value::F32(src.get_f32())
        }
        b'd' => {
            ensure(src, 8)?;
            Value::F64(src.get_f64())
        }
        b'D' => {
            ensure(src, 5)?;
            let scale = src.get_u8();
            let value = src.get_u32();
            Value::Decimal(Decimal { scale, value })
        }
        b'S' => Value::LongStr(read_long_str(src)?),
        b'A' => Value::Array(read_array(src)?),
        b'T' => {
            ensure(src, 8)?;
            Value::Timestamp(src.get_u64())
        }
        b'F' => Value::Table(read_table(src)?),
        b'x' => Value::ByteArray(read_long_str(src)?),
        b'V' => Value::Void,
        other => return Err(DecodeError::UnknownValueTag(other)),
    };
    Ok(value)
}
