use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for the declared value")]
    ErrShortRead,
    #[error("unknown value tag `{tag}`")]
    ErrUnknownTag { tag: u8 },
    #[error("value nesting exceeds the depth limit")]
    ErrDepthLimit,
    #[error("string value is not valid utf-8")]
    ErrNonUtf8String,
    #[error("map key must be a string or an integer")]
    ErrBadMapKey,
    #[error("top-level value must be a packet list")]
    ErrTopLevelNotList,
    #[error("packet list is empty")]
    ErrEmptyPacket,
    #[error("packet type is not a string")]
    ErrPacketTypeNotString,
    #[error("trailing bytes after the packet value")]
    ErrTrailingBytes,
    #[error("integer is out of the encodable range")]
    ErrIntOutOfRange,
    #[error("declared length `{len}` exceeds the remaining input")]
    ErrBadLength { len: u64 },
    #[error("bencode cannot carry a chunked placeholder")]
    ErrChunkedNotSupported,
    #[error("malformed bencode token")]
    ErrBadToken,
}
