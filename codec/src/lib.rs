#![warn(rust_2018_idioms)]

pub mod bencode;
pub mod error;
pub mod rencode;
pub mod value;

pub use error::{Error, Result};
pub use value::{MapKey, Value};

use bytes::{Bytes, BytesMut};

/// Which wire representation a peer speaks.
///
/// `Bencode` is only ever used for the first `hello` exchange, before the
/// negotiated encoder is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEncoder {
    Rencode,
    Bencode,
}

impl PacketEncoder {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketEncoder::Rencode => "rencode",
            PacketEncoder::Bencode => "bencode",
        }
    }

    pub fn from_name(name: &str) -> Option<PacketEncoder> {
        match name {
            "rencode" => Some(PacketEncoder::Rencode),
            "bencode" => Some(PacketEncoder::Bencode),
            _ => None,
        }
    }

    /// 2-bit id recorded in each chunk's flags, so the receiver never has
    /// to guess which decoder a chunk wants.
    pub fn wire_id(&self) -> u8 {
        match self {
            PacketEncoder::Bencode => 0,
            PacketEncoder::Rencode => 1,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<PacketEncoder> {
        match id {
            0 => Some(PacketEncoder::Bencode),
            1 => Some(PacketEncoder::Rencode),
            _ => None,
        }
    }

    /// Encode one packet tuple.
    ///
    /// The tuple is always a list whose first element is the packet-type
    /// string; the encoders reject anything else at the top level.
    pub fn encode(&self, packet: &[Value]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            PacketEncoder::Rencode => rencode::encode_to(packet, &mut buf)?,
            PacketEncoder::Bencode => bencode::encode_to(packet, &mut buf)?,
        }
        Ok(buf.freeze())
    }

    /// Decode one packet tuple, consuming the whole buffer.
    pub fn decode(&self, raw: &Bytes) -> Result<Vec<Value>> {
        match self {
            PacketEncoder::Rencode => rencode::decode(raw),
            PacketEncoder::Bencode => bencode::decode(raw),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encoder_names_round_trip() {
        for enc in [PacketEncoder::Rencode, PacketEncoder::Bencode] {
            assert_eq!(PacketEncoder::from_name(enc.as_str()), Some(enc));
        }
        assert_eq!(PacketEncoder::from_name("yaml"), None);
    }
}
