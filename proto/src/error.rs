use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("frame does not start with the magic byte")]
    ErrBadFrameMagic,
    #[error("chunk header is truncated")]
    ErrChunkHeaderTooSmall,
    #[error("main chunk payload of {len} bytes exceeds the {max} byte limit")]
    ErrMainChunkTooLarge { len: usize, max: usize },
    #[error("auxiliary chunk payload of {len} bytes exceeds the {max} byte limit")]
    ErrAuxChunkTooLarge { len: usize, max: usize },
    #[error("chunk of {len} bytes exceeds the pre-authentication limit")]
    ErrPreAuthChunkTooLarge { len: usize },
    #[error("unknown compressor id `{id}`")]
    ErrUnknownCompressor { id: u8 },
    #[error("unknown compressor name `{0}`")]
    ErrUnknownCompressorName(String),
    #[error("decompressed payload exceeds the size limit")]
    ErrDecompressTooLarge,
    #[error("payload failed to decompress")]
    ErrDecompressFailed,
    #[error("unknown cipher mode `{0}`")]
    ErrUnknownCipherMode(String),
    #[error("unknown packet encoder id `{id}`")]
    ErrUnknownPacketEncoder { id: u8 },
    #[error("chunk failed cipher authentication")]
    ErrCipherAuthFailed,
    #[error("encrypted chunk is shorter than one cipher block")]
    ErrCipherPayloadTooSmall,
    #[error("cipher chunk received but no cipher is negotiated")]
    ErrCipherNotEnabled,
    #[error("auxiliary chunk at level {level} was not announced by the main chunk")]
    ErrUnexpectedAuxChunk { level: u8 },
    #[error("auxiliary chunk length {got} does not match the placeholder length {want}")]
    ErrAuxLengthMismatch { got: usize, want: usize },
    #[error("main chunk is missing {0} announced auxiliary chunks")]
    ErrMissingAuxChunks(usize),
    #[error("chunked placeholder nested below the packet top level")]
    ErrNestedPlaceholder,
    #[error("endpoint is closed")]
    ErrEndpointClosed,
    #[error("no inbound traffic within the liveness timeout")]
    ErrTimeout,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet codec: {0}")]
    Codec(#[from] codec::Error),
}

// The std::io::Error source stops Error deriving PartialEq; tests compare
// on discriminants where needed.
impl Error {
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::ErrTimeout | Error::ErrEndpointClosed)
    }
}
