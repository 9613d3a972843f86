use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Session-core error taxonomy.
///
/// Per-client failures never escape their owning client; only `Internal`
/// and display loss terminate the session itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O and framing failures on one connection.
    #[error("transport: {0}")]
    Transport(#[from] proto::Error),

    /// Well-framed but semantically invalid packets.
    #[error("bad `{packet_type}` packet: {reason}")]
    ErrBadPacket {
        packet_type: String,
        reason: String,
    },
    #[error("unknown packet type `{0}`")]
    ErrUnknownPacketType(String),
    #[error("packet codec: {0}")]
    Codec(#[from] codec::Error),
    #[error("packet type `{0}` is not allowed before authentication")]
    ErrPacketBeforeAuth(String),

    #[error("client version `{client}` is incompatible with `{server}`")]
    ErrVersionMismatch { client: String, server: String },
    #[error("no common {0} with the client")]
    ErrNoCommonCapability(&'static str),

    #[error("authentication failed")]
    ErrAuthenticationFailed,
    #[error("authentication digest `{0}` is not supported")]
    ErrUnknownDigest(String),
    #[error("too many authentication attempts")]
    ErrAuthRetriesExceeded,

    #[error("encoder `{name}` failed: {reason}")]
    ErrEncoderTransient { name: String, reason: String },
    #[error("encoder `{name}` is unusable: {reason}")]
    ErrEncoderPermanent { name: String, reason: String },
    #[error("no usable encoder for the request")]
    ErrNoEncoder,

    #[error("session is busy and sharing is disabled")]
    ErrSessionBusy,
    #[error("operation not permitted in read-only mode")]
    ErrReadOnly,
    #[error("window {0} does not exist")]
    ErrNoSuchWindow(u32),
    #[error("surface dimensions {0}x{1} are invalid")]
    ErrBadDimensions(u32, u32),
    #[error("requested desktop size {0}x{1} is out of range")]
    ErrResolutionOutOfRange(u32, u32),
    #[error("file transfer rejected: {0}")]
    ErrFileRejected(String),
    #[error("clipboard is disabled in this direction")]
    ErrClipboardDirection,

    #[error("session state: {0}")]
    ErrSessionState(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal: {0}")]
    ErrInternal(String),
}

impl Error {
    /// Maps an error to the disconnect reason sent to the offending client.
    pub fn disconnect_reason(&self) -> crate::message::DisconnectReason {
        use crate::message::DisconnectReason;
        match self {
            Error::ErrAuthenticationFailed
            | Error::ErrUnknownDigest(_)
            | Error::ErrAuthRetriesExceeded => DisconnectReason::AuthenticationFailed,
            Error::ErrVersionMismatch { .. } => DisconnectReason::VersionMismatch,
            Error::ErrSessionBusy => DisconnectReason::SessionBusy,
            Error::ErrReadOnly => DisconnectReason::Policy,
            Error::ErrInternal(_) | Error::ErrSessionState(_) => DisconnectReason::ServerShutdown,
            _ => DisconnectReason::ProtocolError,
        }
    }
}
