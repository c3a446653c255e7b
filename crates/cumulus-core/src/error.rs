use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Failures of the presence protocol and its multicast transport.
///
/// Transport-level faults (bind, send, malformed packets) are recovered
/// locally and logged; only the variants below ever reach a caller.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}:{port}: {source}")]
    Bind {
        addr: IpAddr,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no usable local address could be bound")]
    NoUsableAddress,

    #[error("join timed out after {0:?} without a matching announcement")]
    JoinTimeout(Duration),

    #[error("invalid share token: {0}")]
    InvalidToken(String),

    #[error("service is not started")]
    NotStarted,

    #[error("service is shutting down")]
    Stopped,
}

/// Failures of the integrity-verified stream.
///
/// These surface through `AsyncRead`/`AsyncWrite` as `std::io::Error`
/// with the variant attached as the inner error.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("checksum mismatch: computed {computed:016x}, trailer {stored:016x}")]
    ChecksumMismatch { computed: u64, stored: u64 },

    #[error("stream truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("read idle for longer than {0:?}")]
    IdleTimeout(Duration),

    #[error("only rewind-to-start and zero-length relative seeks are supported")]
    UnsupportedSeek,
}

impl StreamError {
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            StreamError::ChecksumMismatch { .. } => io::ErrorKind::InvalidData,
            StreamError::Truncated { .. } => io::ErrorKind::UnexpectedEof,
            StreamError::IdleTimeout(_) => io::ErrorKind::TimedOut,
            StreamError::UnsupportedSeek => io::ErrorKind::Unsupported,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}
