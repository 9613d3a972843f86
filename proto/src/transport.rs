//! Byte-stream transports.
//!
//! A `Transport` is one reliable bidirectional byte stream: TCP, a Unix
//! domain socket, or an in-memory duplex pipe for tests. The endpoint
//! splits it into independently-owned read and write halves so the reader
//! and writer loops never share it.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type TransportReader = ReadHalf<Box<dyn AsyncStream>>;
pub type TransportWriter = WriteHalf<Box<dyn AsyncStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Unix,
    Memory,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
            TransportKind::Memory => "memory",
        }
    }
}

/// Peer description, surfaced in logs and the `info` snapshot.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub kind: TransportKind,
    pub local: String,
    pub peer: String,
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.peer)
    }
}

pub struct Transport {
    stream: Box<dyn AsyncStream>,
    info: TransportInfo,
}

impl Transport {
    pub fn tcp(stream: TcpStream) -> Transport {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        // Draw packets are latency-sensitive; never batch them in the kernel.
        let _ = stream.set_nodelay(true);
        Transport {
            stream: Box::new(stream),
            info: TransportInfo {
                kind: TransportKind::Tcp,
                local,
                peer,
            },
        }
    }

    #[cfg(unix)]
    pub fn unix(stream: UnixStream) -> Transport {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".into());
        Transport {
            stream: Box::new(stream),
            info: TransportInfo {
                kind: TransportKind::Unix,
                local: peer.clone(),
                peer,
            },
        }
    }

    /// Connected in-memory pair, used by the endpoint and session tests.
    pub fn memory_pair(buffer: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(buffer);
        let mk = |stream: tokio::io::DuplexStream, name: &str| Transport {
            stream: Box::new(stream),
            info: TransportInfo {
                kind: TransportKind::Memory,
                local: name.into(),
                peer: name.into(),
            },
        };
        (mk(a, "mem-a"), mk(b, "mem-b"))
    }

    pub fn info(&self) -> &TransportInfo {
        &self.info
    }

    pub fn split(self) -> (TransportReader, TransportWriter, TransportInfo) {
        let (r, w) = tokio::io::split(self.stream);
        (r, w, self.info)
    }
}
