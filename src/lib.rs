#![warn(rust_2018_idioms)]

//! Remote-display session core.
//!
//! One [`session::Session`] owns a virtual display and its forwarded
//! surfaces; any number of clients attach over framed transports, each
//! getting its own damage scheduler, subchannels and feedback loop. The
//! wire layers live in the `xpra-codec` and `xpra-proto` crates,
//! re-exported here.

// re-export the wire-layer crates
pub use codec;
pub use proto;

pub mod auth;
pub mod channels;
pub mod damage;
pub mod encode;
pub mod error;
pub mod message;
pub mod model;
pub mod server;
pub mod session;

pub use error::{Error, Result};
pub use server::{BindOptions, Server};
pub use session::{Session, SessionConfig, SessionHandle};

#[macro_use]
extern crate lazy_static;

/// Process exit codes of the externally visible commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Failure = 1,
    Usage = 2,
    AuthenticationFailed = 10,
    AuthenticationRequired = 11,
    ConnectionFailed = 20,
    ConnectionLost = 21,
    Timeout = 22,
    ProtocolError = 30,
    UnsupportedPeer = 31,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_error(error: &Error) -> ExitCode {
        match error {
            Error::ErrAuthenticationFailed
            | Error::ErrUnknownDigest(_)
            | Error::ErrAuthRetriesExceeded => ExitCode::AuthenticationFailed,
            Error::Io(_) => ExitCode::ConnectionFailed,
            Error::Transport(proto::Error::ErrTimeout) => ExitCode::Timeout,
            Error::Transport(e) if e.is_protocol() => ExitCode::ProtocolError,
            Error::Transport(_) => ExitCode::ConnectionLost,
            Error::ErrVersionMismatch { .. } => ExitCode::UnsupportedPeer,
            Error::Codec(_)
            | Error::ErrBadPacket { .. }
            | Error::ErrUnknownPacketType(_)
            | Error::ErrPacketBeforeAuth(_) => ExitCode::ProtocolError,
            _ => ExitCode::Failure,
        }
    }
}

lazy_static! {
    /// Debug toggles from the environment, `XPRA_*` namespaced.
    pub static ref ENV_DEBUG: Vec<String> = std::env::vars()
        .filter(|(k, _)| k.starts_with("XPRA_"))
        .map(|(k, _)| k)
        .collect();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(
            ExitCode::from_error(&Error::ErrAuthenticationFailed).code(),
            10
        );
        assert_eq!(
            ExitCode::from_error(&Error::Transport(proto::Error::ErrTimeout)).code(),
            22
        );
        assert_eq!(
            ExitCode::from_error(&Error::ErrUnknownPacketType("x".into())).code(),
            30
        );
    }
}
