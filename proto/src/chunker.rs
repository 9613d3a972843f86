//! Logical-packet assembly.
//!
//! A packet tuple whose top-level byte-string arguments exceed the inline
//! threshold is split: the big arguments are lifted out of the main chunk,
//! replaced by `Chunked` placeholders, and shipped as auxiliary chunks at
//! levels `1..=n` immediately after the main chunk. Reassembly rebinds the
//! placeholders before the packet is dispatched.

use bytes::Bytes;
use codec::{PacketEncoder, Value};

use crate::error::{Error, Result};
use crate::frame::ChunkHeader;

/// Byte-string arguments larger than this leave the main chunk.
pub const DEFAULT_INLINE_THRESHOLD: usize = 512;

/// One encoded logical packet: the main payload plus the auxiliary
/// payloads in level order.
#[derive(Debug)]
pub struct EncodedPacket {
    pub main: Bytes,
    pub auxiliaries: Vec<Bytes>,
}

/// Encodes a packet tuple, lifting large top-level byte strings into
/// auxiliary chunks.
pub fn encode_packet(
    encoder: PacketEncoder,
    packet: &[Value],
    inline_threshold: usize,
) -> Result<EncodedPacket> {
    let mut auxiliaries: Vec<Bytes> = Vec::new();
    let mut main_args: Vec<Value> = Vec::with_capacity(packet.len());

    // The bencode fallback predates the escape; while it is in force
    // everything stays inline.
    let escape = encoder == PacketEncoder::Rencode;

    for arg in packet {
        match arg {
            Value::Bytes(b) if escape && b.len() > inline_threshold => {
                let index = auxiliaries.len() as u8 + 1;
                auxiliaries.push(b.clone());
                main_args.push(Value::Chunked {
                    index,
                    len: b.len() as u32,
                });
            }
            other => main_args.push(other.clone()),
        }
    }

    let main = encoder.encode(&main_args)?;
    Ok(EncodedPacket { main, auxiliaries })
}

/// Collects the chunks of one logical packet and yields the reassembled
/// tuple once every announced auxiliary has arrived.
#[derive(Default)]
pub struct Reassembler {
    pending: Option<PendingPacket>,
}

struct PendingPacket {
    args: Vec<Value>,
    /// (argument position, expected length) per placeholder, level order.
    placeholders: Vec<(usize, u32)>,
    received: Vec<Bytes>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// True while auxiliary chunks are still owed.
    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn push_chunk(
        &mut self,
        encoder: PacketEncoder,
        header: &ChunkHeader,
        payload: Bytes,
    ) -> Result<Option<Vec<Value>>> {
        if header.is_main() {
            if let Some(pending) = &self.pending {
                // Main chunk while auxiliaries are owed.
                return Err(Error::ErrMissingAuxChunks(
                    pending.placeholders.len() - pending.received.len(),
                ));
            }
            let args = encoder.decode(&payload)?;
            let mut placeholders = Vec::new();
            for (pos, arg) in args.iter().enumerate() {
                match arg {
                    Value::Chunked { index, len } => {
                        if *index as usize != placeholders.len() + 1 {
                            return Err(Error::ErrUnexpectedAuxChunk { level: *index });
                        }
                        placeholders.push((pos, *len));
                    }
                    other => check_no_nested_placeholder(other)?,
                }
            }
            if placeholders.is_empty() {
                return Ok(Some(args));
            }
            self.pending = Some(PendingPacket {
                args,
                placeholders,
                received: Vec::new(),
            });
            return Ok(None);
        }

        let pending = match &mut self.pending {
            Some(p) => p,
            None => {
                return Err(Error::ErrUnexpectedAuxChunk {
                    level: header.level,
                })
            }
        };
        let expected_level = pending.received.len() as u8 + 1;
        if header.level != expected_level || header.level as usize > pending.placeholders.len() {
            return Err(Error::ErrUnexpectedAuxChunk {
                level: header.level,
            });
        }
        let (_, want) = pending.placeholders[pending.received.len()];
        if payload.len() != want as usize {
            return Err(Error::ErrAuxLengthMismatch {
                got: payload.len(),
                want: want as usize,
            });
        }
        pending.received.push(payload);

        if pending.received.len() < pending.placeholders.len() {
            return Ok(None);
        }

        let mut done = self.pending.take().expect("pending packet");
        for (k, payload) in done.received.drain(..).enumerate() {
            let (pos, _) = done.placeholders[k];
            done.args[pos] = Value::Bytes(payload);
        }
        Ok(Some(done.args))
    }
}

fn check_no_nested_placeholder(value: &Value) -> Result<()> {
    match value {
        Value::Chunked { .. } => Err(Error::ErrNestedPlaceholder),
        Value::List(l) => {
            for v in l {
                check_no_nested_placeholder(v)?;
            }
            Ok(())
        }
        Value::Map(m) => {
            for v in m.values() {
                check_no_nested_placeholder(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(
        reassembler: &mut Reassembler,
        encoded: &EncodedPacket,
    ) -> Result<Option<Vec<Value>>> {
        let total = encoded.auxiliaries.len();
        let mut header = ChunkHeader::main(encoded.main.len());
        header.more = total > 0;
        let mut out = reassembler.push_chunk(PacketEncoder::Rencode, &header, encoded.main.clone())?;
        for (k, aux) in encoded.auxiliaries.iter().enumerate() {
            let mut header = ChunkHeader::auxiliary(k as u8 + 1, aux.len());
            header.more = k + 1 < total;
            out = reassembler.push_chunk(PacketEncoder::Rencode, &header, aux.clone())?;
        }
        Ok(out)
    }

    #[test]
    fn test_small_packet_stays_inline() {
        let packet = vec![
            Value::Str("damage-sequence".into()),
            Value::Int(1),
            Value::Bytes(Bytes::from_static(b"small")),
        ];
        let encoded = encode_packet(PacketEncoder::Rencode, &packet, 512).unwrap();
        assert!(encoded.auxiliaries.is_empty());

        let mut r = Reassembler::new();
        assert_eq!(feed(&mut r, &encoded).unwrap().unwrap(), packet);
    }

    #[test]
    fn test_large_arguments_round_trip() {
        let big_a = Bytes::from(vec![1u8; 4096]);
        let big_b = Bytes::from(vec![2u8; 9000]);
        let packet = vec![
            Value::Str("draw".into()),
            Value::Int(1),
            Value::Bytes(big_a.clone()),
            Value::Str("rgb24".into()),
            Value::Bytes(big_b.clone()),
        ];
        let encoded = encode_packet(PacketEncoder::Rencode, &packet, 512).unwrap();
        assert_eq!(encoded.auxiliaries.len(), 2);
        assert_eq!(encoded.auxiliaries[0], big_a);
        assert_eq!(encoded.auxiliaries[1], big_b);

        let mut r = Reassembler::new();
        let out = feed(&mut r, &encoded).unwrap().unwrap();
        assert_eq!(out, packet);
        assert!(!r.in_flight());
    }

    #[test]
    fn test_main_chunk_while_aux_owed() {
        let packet = vec![
            Value::Str("draw".into()),
            Value::Bytes(Bytes::from(vec![0u8; 1024])),
        ];
        let encoded = encode_packet(PacketEncoder::Rencode, &packet, 512).unwrap();
        let mut r = Reassembler::new();
        let mut header = ChunkHeader::main(encoded.main.len());
        header.more = true;
        assert!(r
            .push_chunk(PacketEncoder::Rencode, &header, encoded.main.clone())
            .unwrap()
            .is_none());
        // Second main before the auxiliary arrives.
        assert!(matches!(
            r.push_chunk(PacketEncoder::Rencode, &header, encoded.main.clone()),
            Err(Error::ErrMissingAuxChunks(1))
        ));
    }

    #[test]
    fn test_aux_without_main() {
        let mut r = Reassembler::new();
        let header = ChunkHeader::auxiliary(1, 4);
        assert!(matches!(
            r.push_chunk(PacketEncoder::Rencode, &header, Bytes::from_static(b"zzzz")),
            Err(Error::ErrUnexpectedAuxChunk { level: 1 })
        ));
    }

    #[test]
    fn test_aux_length_mismatch() {
        let packet = vec![
            Value::Str("draw".into()),
            Value::Bytes(Bytes::from(vec![0u8; 1024])),
        ];
        let encoded = encode_packet(PacketEncoder::Rencode, &packet, 512).unwrap();
        let mut r = Reassembler::new();
        let mut header = ChunkHeader::main(encoded.main.len());
        header.more = true;
        r.push_chunk(PacketEncoder::Rencode, &header, encoded.main.clone())
            .unwrap();
        let header = ChunkHeader::auxiliary(1, 3);
        assert!(matches!(
            r.push_chunk(PacketEncoder::Rencode, &header, Bytes::from_static(b"abc")),
            Err(Error::ErrAuxLengthMismatch { got: 3, want: 1024 })
        ));
    }

    #[test]
    fn test_bencode_never_escapes() {
        let packet = vec![
            Value::Str("hello".into()),
            Value::Bytes(Bytes::from(vec![9u8; 4096])),
        ];
        let encoded = encode_packet(PacketEncoder::Bencode, &packet, 512).unwrap();
        assert!(encoded.auxiliaries.is_empty());
    }

    #[test]
    fn test_nested_placeholder_rejected() {
        let evil = vec![
            Value::Str("draw".into()),
            Value::List(vec![Value::Chunked { index: 1, len: 10 }]),
        ];
        let main = PacketEncoder::Rencode.encode(&evil).unwrap();
        let mut r = Reassembler::new();
        let header = ChunkHeader::main(main.len());
        assert!(matches!(
            r.push_chunk(PacketEncoder::Rencode, &header, main),
            Err(Error::ErrNestedPlaceholder)
        ));
    }
}
