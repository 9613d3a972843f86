//! Primary packet encoder.
//!
//! A compact tagged binary format: small integers are embedded in the tag
//! byte, everything else is a one-byte tag followed by a fixed-width length
//! or value. All multi-byte integers are big-endian.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::value::{MapKey, Value};

const TAG_INT8: u8 = 0x01;
const TAG_INT16: u8 = 0x02;
const TAG_INT32: u8 = 0x03;
const TAG_INT64: u8 = 0x04;
const TAG_TRUE: u8 = 0x05;
const TAG_FALSE: u8 = 0x06;
const TAG_BYTES: u8 = 0x07;
const TAG_STR: u8 = 0x08;
const TAG_LIST: u8 = 0x09;
const TAG_MAP: u8 = 0x0a;
const TAG_CHUNKED: u8 = 0x0b;

// 0x80..=0xbf embeds 0..=63, 0xc0..=0xdf embeds -1..=-32.
const SMALL_INT_BASE: u8 = 0x80;
const SMALL_INT_MAX: i64 = 63;
const SMALL_NEG_BASE: u8 = 0xc0;
const SMALL_NEG_MIN: i64 = -32;

/// Nesting bound, applied on both encode and decode so a hostile peer
/// cannot drive the decoder into unbounded recursion.
const MAX_DEPTH: usize = 32;

pub fn encode_to(packet: &[Value], buf: &mut BytesMut) -> Result<()> {
    write_list_header(packet.len(), buf);
    for v in packet {
        write_value(v, buf, 1)?;
    }
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

fn write_list_header(count: usize, buf: &mut BytesMut) {
    buf.put_u8(TAG_LIST);
    buf.put_u32(count as u32);
}

fn write_value(value: &Value, buf: &mut BytesMut, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::ErrDepthLimit);
    }
    match value {
        Value::Int(i) => write_int(*i, buf),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32(b.len() as u32);
            buf.extend_from_slice(b);
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            buf.put_u32(s.len() as u32);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::List(l) => {
            write_list_header(l.len(), buf);
            for v in l {
                write_value(v, buf, depth + 1)?;
            }
        }
        Value::Map(m) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32(m.len() as u32);
            for (k, v) in m {
                match k {
                    MapKey::Str(s) => write_value(&Value::Str(s.clone()), buf, depth + 1)?,
                    MapKey::Int(i) => write_int(*i, buf),
                }
                write_value(v, buf, depth + 1)?;
            }
        }
        Value::Chunked { index, len } => {
            buf.put_u8(TAG_CHUNKED);
            buf.put_u8(*index);
            buf.put_u32(*len);
        }
    }
    Ok(())
}

fn write_int(i: i64, buf: &mut BytesMut) {
    if (0..=SMALL_INT_MAX).contains(&i) {
        buf.put_u8(SMALL_INT_BASE + i as u8);
    } else if (SMALL_NEG_MIN..0).contains(&i) {
        buf.put_u8(SMALL_NEG_BASE + (-i - 1) as u8);
    } else if i >= i8::MIN as i64 && i <= i8::MAX as i64 {
        buf.put_u8(TAG_INT8);
        buf.put_i8(i as i8);
    } else if i >= i16::MIN as i64 && i <= i16::MAX as i64 {
        buf.put_u8(TAG_INT16);
        buf.put_i16(i as i16);
    } else if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
        buf.put_u8(TAG_INT32);
        buf.put_i32(i as i32);
    } else {
        buf.put_u8(TAG_INT64);
        buf.put_i64(i);
    }
}

fn read_value(reader: &mut Bytes, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::ErrDepthLimit);
    }
    if !reader.has_remaining() {
        return Err(Error::ErrShortRead);
    }
    let tag = reader.get_u8();
    if tag >= SMALL_INT_BASE && tag < SMALL_INT_BASE + (SMALL_INT_MAX as u8) + 1 {
        return Ok(Value::Int((tag - SMALL_INT_BASE) as i64));
    }
    if tag >= SMALL_NEG_BASE && tag < SMALL_NEG_BASE + (-SMALL_NEG_MIN as u8) {
        return Ok(Value::Int(-((tag - SMALL_NEG_BASE) as i64) - 1));
    }
    match tag {
        TAG_INT8 => {
            check_remaining(reader, 1)?;
            Ok(Value::Int(reader.get_i8() as i64))
        }
        TAG_INT16 => {
            check_remaining(reader, 2)?;
            Ok(Value::Int(reader.get_i16() as i64))
        }
        TAG_INT32 => {
            check_remaining(reader, 4)?;
            Ok(Value::Int(reader.get_i32() as i64))
        }
        TAG_INT64 => {
            check_remaining(reader, 8)?;
            Ok(Value::Int(reader.get_i64()))
        }
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_BYTES => {
            let len = read_len(reader)?;
            Ok(Value::Bytes(reader.copy_to_bytes(len)))
        }
        TAG_STR => {
            let len = read_len(reader)?;
            let raw = reader.copy_to_bytes(len);
            let s = std::str::from_utf8(&raw).map_err(|_| Error::ErrNonUtf8String)?;
            Ok(Value::Str(s.to_owned()))
        }
        TAG_LIST => {
            let count = read_count(reader)?;
            let mut list = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                list.push(read_value(reader, depth + 1)?);
            }
            Ok(Value::List(list))
        }
        TAG_MAP => {
            let count = read_count(reader)?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = match read_value(reader, depth + 1)? {
                    Value::Str(s) => MapKey::Str(s),
                    Value::Int(i) => MapKey::Int(i),
                    _ => return Err(Error::ErrBadMapKey),
                };
                let value = read_value(reader, depth + 1)?;
                map.insert(key, value);
            }
            Ok(Value::Map(map))
        }
        TAG_CHUNKED => {
            check_remaining(reader, 5)?;
            let index = reader.get_u8();
            let len = reader.get_u32();
            Ok(Value::Chunked { index, len })
        }
        tag => Err(Error::ErrUnknownTag { tag }),
    }
}

fn check_remaining(reader: &Bytes, need: usize) -> Result<()> {
    if reader.remaining() < need {
        Err(Error::ErrShortRead)
    } else {
        Ok(())
    }
}

fn read_len(reader: &mut Bytes) -> Result<usize> {
    check_remaining(reader, 4)?;
    let len = reader.get_u32() as usize;
    if reader.remaining() < len {
        return Err(Error::ErrBadLength { len: len as u64 });
    }
    Ok(len)
}

fn read_count(reader: &mut Bytes) -> Result<usize> {
    check_remaining(reader, 4)?;
    let count = reader.get_u32() as usize;
    // Every element costs at least one tag byte.
    if reader.remaining() < count {
        return Err(Error::ErrBadLength { len: count as u64 });
    }
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vmap;

    fn round_trip(packet: Vec<Value>) {
        let mut buf = BytesMut::new();
        encode_to(&packet, &mut buf).unwrap();
        let decoded = decode(&buf.freeze()).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_round_trip_scalars() {
        round_trip(vec![
            Value::Str("ping".into()),
            Value::Int(0),
            Value::Int(63),
            Value::Int(64),
            Value::Int(-1),
            Value::Int(-32),
            Value::Int(-33),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Bool(true),
            Value::Bool(false),
        ]);
    }

    #[test]
    fn test_round_trip_nested() {
        round_trip(vec![
            Value::Str("hello".into()),
            vmap! {
                "version" => "6.0",
                "encodings" => Value::List(vec!["rgb".into(), "png".into()]),
                5 => Value::Bytes(Bytes::from_static(b"\x00\x01\xff")),
            },
            Value::List(vec![Value::List(vec![Value::Int(1)])]),
        ]);
    }

    #[test]
    fn test_round_trip_chunked_placeholder() {
        round_trip(vec![
            Value::Str("draw".into()),
            Value::Int(1),
            Value::Chunked { index: 1, len: 65536 },
        ]);
    }

    #[test]
    fn test_small_int_encoding_is_one_byte() {
        let mut buf = BytesMut::new();
        write_value(&Value::Int(7), &mut buf, 0).unwrap();
        assert_eq!(buf.len(), 1);
        let mut buf = BytesMut::new();
        write_value(&Value::Int(-7), &mut buf, 0).unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_unknown_tag_is_typed_error() {
        // 1-element list whose element carries a tag we never emit.
        let raw = Bytes::from_static(&[TAG_LIST, 0, 0, 0, 1, 0x3f]);
        assert_eq!(
            read_value(&mut raw.clone(), 0).unwrap_err(),
            Error::ErrUnknownTag { tag: 0x3f }
        );
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = BytesMut::new();
        encode_to(&[Value::Str("info".into()), Value::Int(123456)], &mut buf).unwrap();
        let full = buf.freeze();
        for cut in 1..full.len() {
            assert!(decode(&full.slice(..cut)).is_err(), "cut at {cut} must fail");
        }
    }

    #[test]
    fn test_oversized_count_rejected_without_allocation() {
        let raw = Bytes::from_static(&[TAG_LIST, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(decode(&raw), Err(Error::ErrBadLength { .. })));
    }

    #[test]
    fn test_top_level_must_be_typed_packet() {
        let mut buf = BytesMut::new();
        write_value(&Value::Int(3), &mut buf, 0).unwrap();
        assert_eq!(decode(&buf.freeze()).unwrap_err(), Error::ErrTopLevelNotList);

        let mut buf = BytesMut::new();
        encode_to(&[], &mut buf).unwrap();
        assert_eq!(decode(&buf.freeze()).unwrap_err(), Error::ErrEmptyPacket);

        let mut buf = BytesMut::new();
        encode_to(&[Value::Int(9)], &mut buf).unwrap();
        assert_eq!(
            decode(&buf.freeze()).unwrap_err(),
            Error::ErrPacketTypeNotString
        );
    }

    #[test]
    fn test_depth_limit() {
        let mut v = Value::Int(1);
        for _ in 0..40 {
            v = Value::List(vec![v]);
        }
        let mut buf = BytesMut::new();
        assert_eq!(
            encode_to(&[Value::Str("deep".into()), v], &mut buf).unwrap_err(),
            Error::ErrDepthLimit
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        encode_to(&[Value::Str("ping".into())], &mut buf).unwrap();
        buf.put_u8(0);
        assert_eq!(decode(&buf.freeze()).unwrap_err(), Error::ErrTrailingBytes);
    }
}
