//! Fallback packet encoder, used only for the initial `hello` exchange.
//!
//! Classic bencode with two liberties the hello packet relies on: booleans
//! travel as `i1e`/`i0e`, and dictionary keys may be integers (`i..e` in key
//! position). Byte strings that decode as valid utf-8 come back as strings;
//! the hello schema never puts opaque binary where that matters.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::value::{MapKey, Value};

const MAX_DEPTH: usize = 32;

pub fn encode_to(packet: &[Value], buf: &mut BytesMut) -> Result<()> {
    buf.put_u8(b'l');
    for v in packet {
        write_value(v, buf, 1)?;
    }
    buf.put_u8(b'e');
    Ok(())
}

pub fn decode(raw: &Bytes) -> Result<Vec<Value>> {
    let reader = &mut raw.clone();
    let value = read_value(reader, 0)?;
    if reader.has_remaining() {
        return Err(Error::ErrTrailingBytes);
    }
    let list = match value {
        Value::List(l) => l,
        _ => return Err(Error::ErrTopLevelNotList),
    };
    match list.first() {
        None => Err(Error::ErrEmptyPacket),
        Some(Value::Str(_)) => Ok(list),
        Some(_) => Err(Error::ErrPacketTypeNotString),
    }
}

fn write_value(value: &Value, buf: &mut BytesMut, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::ErrDepthLimit);
    }
    match value {
        Value::Int(i) => write_int(*i, buf),
        Value::Bool(b) => write_int(*b as i64, buf),
        Value::Bytes(b) => write_bytes(b, buf),
        Value::Str(s) => write_bytes(s.as_bytes(), buf),
        Value::List(l) => {
            buf.put_u8(b'l');
            for v in l {
                write_value(v, buf, depth + 1)?;
            }
            buf.put_u8(b'e');
        }
        Value::Map(m) => {
            buf.put_u8(b'd');
            for (k, v) in m {
                match k {
                    MapKey::Str(s) => write_bytes(s.as_bytes(), buf),
                    MapKey::Int(i) => write_int(*i, buf),
                }
                write_value(v, buf, depth + 1)?;
            }
            buf.put_u8(b'e');
        }
        Value::Chunked { .. } => return Err(Error::ErrChunkedNotSupported),
    }
    Ok(())
}

fn write_int(i: i64, buf: &mut BytesMut) {
    buf.put_u8(b'i');
    buf.extend_from_slice(i.to_string().as_bytes());
    buf.put_u8(b'e');
}

fn write_bytes(b: &[u8], buf: &mut BytesMut) {
    buf.extend_from_slice(b.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.extend_from_slice(b);
}

fn read_value(reader: &mut Bytes, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::ErrDepthLimit);
    }
    match peek(reader)? {
        b'i' => {
            reader.advance(1);
            Ok(Value::Int(read_int_until(reader, b'e')?))
        }
        b'l' => {
            reader.advance(1);
            let mut list = Vec::new();
            while peek(reader)? != b'e' {
                list.push(read_value(reader, depth + 1)?);
            }
            reader.advance(1);
            Ok(Value::List(list))
        }
        b'd' => {
            reader.advance(1);
            let mut map = BTreeMap::new();
            while peek(reader)? != b'e' {
                let key = match read_value(reader, depth + 1)? {
                    Value::Str(s) => MapKey::Str(s),
                    Value::Bytes(b) => {
                        // Keys must be text.
                        let s = std::str::from_utf8(&b).map_err(|_| Error::ErrBadMapKey)?;
                        MapKey::Str(s.to_owned())
                    }
                    Value::Int(i) => MapKey::Int(i),
                    _ => return Err(Error::ErrBadMapKey),
                };
                let value = read_value(reader, depth + 1)?;
                map.insert(key, value);
            }
            reader.advance(1);
            Ok(Value::Map(map))
        }
        b'0'..=b'9' => {
            let len = read_int_until(reader, b':')?;
            let len = usize::try_from(len).map_err(|_| Error::ErrBadToken)?;
            if reader.remaining() < len {
                return Err(Error::ErrBadLength { len: len as u64 });
            }
            let raw = reader.copy_to_bytes(len);
            match std::str::from_utf8(&raw) {
                Ok(s) => Ok(Value::Str(s.to_owned())),
                Err(_) => Ok(Value::Bytes(raw)),
            }
        }
        _ => Err(Error::ErrBadToken),
    }
}

fn peek(reader: &Bytes) -> Result<u8> {
    reader.first().copied().ok_or(Error::ErrShortRead)
}

fn read_int_until(reader: &mut Bytes, terminator: u8) -> Result<i64> {
    let mut digits = Vec::new();
    loop {
        if !reader.has_remaining() {
            return Err(Error::ErrShortRead);
        }
        let b = reader.get_u8();
        if b == terminator {
            break;
        }
        if !(b.is_ascii_digit() || (b == b'-' && digits.is_empty())) {
            return Err(Error::ErrBadToken);
        }
        digits.push(b);
        if digits.len() > 20 {
            return Err(Error::ErrIntOutOfRange);
        }
    }
    let s = std::str::from_utf8(&digits).map_err(|_| Error::ErrBadToken)?;
    s.parse::<i64>().map_err(|_| Error::ErrIntOutOfRange)
}
