#![warn(rust_2018_idioms)]

pub mod chunker;
pub mod compress;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod transport;


pub use chunker::{encode_packet, EncodedPacket, Reassembler, DEFAULT_INLINE_THRESHOLD};
pub use compress::{Compressor, MIN_COMPRESS_SIZE};
pub use crypto::{
    derive_session_keys, CipherMode, CryptoContext, DirectionKey, SessionKeys,
    DEFAULT_KDF_ITERATIONS,
};
pub use endpoint::{Endpoint, EndpointConfig, EndpointEvent, EndpointStats, PacketPriority};
pub use error::{Error, Result};
pub use frame::{
    ChunkHeader, AUX_CHUNK_MAX, CHUNK_HEADER_SIZE, FRAME_MAGIC, MAIN_CHUNK_MAX, PREAUTH_CHUNK_MAX,
};
pub use transport::{Transport, TransportInfo, TransportKind};

/// Default TCP/TLS listening port.
pub const DEFAULT_PORT: u16 = 14500;
