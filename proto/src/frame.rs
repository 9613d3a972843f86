//! Chunk framing.
//!
//! Every unit on the wire is one chunk:
//!
//! ```text
//!  0      1      2      3      4              8
//! +------+------+------+------+--------------+----------
//! | 'P'  |flags |level |index | len (u32 BE) | payload
//! +------+------+------+------+--------------+----------
//! ```
//!
//! flags: bit0 compressed, bits1-2 compressor id, bit3 cipher block,
//! bit4 more-to-follow, bits5-6 packet-encoder id. A logical packet is
//! the level-0 main chunk plus `n` auxiliary chunks at levels `1..=n`,
//! all flagged more-to-follow except the last chunk of the packet. The
//! per-chunk encoder id lets the receiver pick the right decoder even
//! across the hello exchange, where the fallback encoder hands over to
//! the negotiated one mid-stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const FRAME_MAGIC: u8 = b'P';
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Main-chunk payload cap.
pub const MAIN_CHUNK_MAX: usize = 256 * 1024;
/// Auxiliary-chunk payload cap.
pub const AUX_CHUNK_MAX: usize = 4 * 1024 * 1024;
/// Cap applied to every chunk until the peer has authenticated.
pub const PREAUTH_CHUNK_MAX: usize = 16 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const COMPRESSOR_SHIFT: u8 = 1;
const COMPRESSOR_MASK: u8 = 0b0000_0110;
const FLAG_CIPHER: u8 = 0b0000_1000;
const FLAG_MORE: u8 = 0b0001_0000;
const ENCODER_SHIFT: u8 = 5;
const ENCODER_MASK: u8 = 0b0110_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    pub compressed: bool,
    pub compressor_id: u8,
    pub cipher: bool,
    pub more: bool,
    /// Which packet encoder produced the main chunk's payload.
    pub encoder_id: u8,
    /// 0 for the main chunk, `k` for the chunk carrying placeholder `k`.
    pub level: u8,
    /// Position of this chunk within its logical packet.
    pub index: u8,
    pub payload_len: u32,
}

impl ChunkHeader {
    pub fn main(payload_len: usize) -> Self {
        ChunkHeader {
            level: 0,
            index: 0,
            payload_len: payload_len as u32,
            ..Default::default()
        }
    }

    pub fn auxiliary(level: u8, payload_len: usize) -> Self {
        ChunkHeader {
            level,
            index: level,
            payload_len: payload_len as u32,
            ..Default::default()
        }
    }

    pub fn is_main(&self) -> bool {
        self.level == 0
    }

    pub fn marshal(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut flags = 0u8;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
            flags |= (self.compressor_id << COMPRESSOR_SHIFT) & COMPRESSOR_MASK;
        }
        if self.cipher {
            flags |= FLAG_CIPHER;
        }
        if self.more {
            flags |= FLAG_MORE;
        }
        flags |= (self.encoder_id << ENCODER_SHIFT) & ENCODER_MASK;
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        {
            let mut writer = &mut header[..];
            writer.put_u8(FRAME_MAGIC);
            writer.put_u8(flags);
            writer.put_u8(self.level);
            writer.put_u8(self.index);
            writer.put_u32(self.payload_len);
        }
        header
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderTooSmall);
        }
        let reader = &mut Bytes::copy_from_slice(&raw[..CHUNK_HEADER_SIZE]);
        if reader.get_u8() != FRAME_MAGIC {
            return Err(Error::ErrBadFrameMagic);
        }
        let flags = reader.get_u8();
        let level = reader.get_u8();
        let index = reader.get_u8();
        let payload_len = reader.get_u32();
        Ok(ChunkHeader {
            compressed: flags & FLAG_COMPRESSED != 0,
            compressor_id: (flags & COMPRESSOR_MASK) >> COMPRESSOR_SHIFT,
            cipher: flags & FLAG_CIPHER != 0,
            more: flags & FLAG_MORE != 0,
            encoder_id: (flags & ENCODER_MASK) >> ENCODER_SHIFT,
            level,
            index,
            payload_len,
        })
    }

    /// Validates the declared payload length against the per-level caps.
    pub fn check_limits(&self, pre_auth: bool) -> Result<()> {
        let len = self.payload_len as usize;
        if pre_auth && len > PREAUTH_CHUNK_MAX {
            return Err(Error::ErrPreAuthChunkTooLarge { len });
        }
        if self.is_main() {
            if len > MAIN_CHUNK_MAX {
                return Err(Error::ErrMainChunkTooLarge {
                    len,
                    max: MAIN_CHUNK_MAX,
                });
            }
        } else if len > AUX_CHUNK_MAX {
            return Err(Error::ErrAuxChunkTooLarge {
                len,
                max: AUX_CHUNK_MAX,
            });
        }
        Ok(())
    }
}

/// Marshals a header + payload pair into one buffer.
pub fn write_chunk(header: &ChunkHeader, payload: &[u8], buf: &mut BytesMut) {
    debug_assert_eq!(header.payload_len as usize, payload.len());
    buf.extend_from_slice(&header.marshal());
    buf.extend_from_slice(payload);
}
