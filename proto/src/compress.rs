//! Per-chunk payload compression.
//!
//! The 2-bit wire id is fixed; which compressors a connection may use is
//! settled during capability exchange, but the id recorded in each chunk's
//! flags is authoritative for that chunk.

use std::io::Read;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Payloads at or below this size are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compressor {
    #[default]
    None,
    Lz4,
    Zlib,
    Brotli,
}

impl Compressor {
    pub const ALL: [Compressor; 4] = [
        Compressor::None,
        Compressor::Lz4,
        Compressor::Zlib,
        Compressor::Brotli,
    ];

    pub fn wire_id(&self) -> u8 {
        match self {
            Compressor::None => 0,
            Compressor::Lz4 => 1,
            Compressor::Zlib => 2,
            Compressor::Brotli => 3,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Compressor> {
        match id {
            0 => Ok(Compressor::None),
            1 => Ok(Compressor::Lz4),
            2 => Ok(Compressor::Zlib),
            3 => Ok(Compressor::Brotli),
            id => Err(Error::ErrUnknownCompressor { id }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Lz4 => "lz4",
            Compressor::Zlib => "zlib",
            Compressor::Brotli => "brotli",
        }
    }

    pub fn from_name(name: &str) -> Result<Compressor> {
        match name {
            "none" => Ok(Compressor::None),
            "lz4" => Ok(Compressor::Lz4),
            "zlib" => Ok(Compressor::Zlib),
            "brotli" => Ok(Compressor::Brotli),
            other => Err(Error::ErrUnknownCompressorName(other.to_owned())),
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Bytes> {
        match self {
            Compressor::None => Ok(Bytes::copy_from_slice(data)),
            Compressor::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(data))),
            Compressor::Zlib => {
                let mut encoder = flate2::read::ZlibEncoder::new(
                    data,
                    flate2::Compression::default(),
                );
                let mut out = Vec::new();
                encoder.read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
            Compressor::Brotli => {
                let mut out = Vec::new();
                let mut reader = data;
                let params = brotli::enc::BrotliEncoderParams {
                    quality: 5,
                    ..Default::default()
                };
                brotli::BrotliCompress(&mut reader, &mut out, &params)?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// Decompress with an output bound; anything larger is treated as a
    /// protocol error rather than an allocation.
    pub fn decompress(&self, data: &[u8], max_size: usize) -> Result<Bytes> {
        match self {
            Compressor::None => Ok(Bytes::copy_from_slice(data)),
            Compressor::Lz4 => {
                if data.len() < 4 {
                    return Err(Error::ErrDecompressFailed);
                }
                let declared =
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
                if declared > max_size {
                    return Err(Error::ErrDecompressTooLarge);
                }
                lz4_flex::decompress_size_prepended(data)
                    .map(Bytes::from)
                    .map_err(|_| Error::ErrDecompressFailed)
            }
            Compressor::Zlib => {
                let decoder = flate2::read::ZlibDecoder::new(data);
                bounded_read(decoder, max_size)
            }
            Compressor::Brotli => {
                let decoder = brotli::Decompressor::new(data, 4096);
                bounded_read(decoder, max_size)
            }
        }
    }
}

fn bounded_read<R: Read>(reader: R, max_size: usize) -> Result<Bytes> {
    let mut out = Vec::new();
    let mut limited = reader.take(max_size as u64 + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|_| Error::ErrDecompressFailed)?;
    if out.len() > max_size {
        return Err(Error::ErrDecompressTooLarge);
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        // Compressible but not trivial.
        (0..len).map(|i| ((i / 7) % 251) as u8).collect()
    }

    #[test]
    fn test_wire_id_round_trip() {
        for c in Compressor::ALL {
            assert_eq!(Compressor::from_wire_id(c.wire_id()).unwrap(), c);
            assert_eq!(Compressor::from_name(c.as_str()).unwrap(), c);
        }
        assert!(Compressor::from_wire_id(4).is_err());
        assert!(Compressor::from_name("zstd").is_err());
    }

    #[test]
    fn test_round_trip_all_compressors() {
        for c in Compressor::ALL {
            for len in [0usize, 1, 127, 128, 4096, 1 << 20] {
                let data = sample(len);
                let packed = c.compress(&data).unwrap();
                let unpacked = c.decompress(&packed, 4 * 1024 * 1024).unwrap();
                assert_eq!(&unpacked[..], &data[..], "compressor {c:?} len {len}");
            }
        }
    }

    #[test]
    fn test_round_trip_random_bytes() {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut data = vec![0u8; 64 * 1024];
        rng.fill_bytes(&mut data);
        for c in Compressor::ALL {
            let packed = c.compress(&data).unwrap();
            let unpacked = c.decompress(&packed, 4 * 1024 * 1024).unwrap();
            assert_eq!(&unpacked[..], &data[..]);
        }
    }

    #[test]
    fn test_decompress_bound() {
        let data = sample(1 << 20);
        for c in [Compressor::Lz4, Compressor::Zlib, Compressor::Brotli] {
            let packed = c.compress(&data).unwrap();
            assert!(matches!(
                c.decompress(&packed, 1024),
                Err(Error::ErrDecompressTooLarge)
            ));
        }
    }

    #[test]
    fn test_garbage_input() {
        let garbage = b"not a compressed payload at all";
        for c in [Compressor::Lz4, Compressor::Zlib, Compressor::Brotli] {
            assert!(c.decompress(garbage, 1 << 20).is_err(), "{c:?}");
        }
    }
}
