use std::time::Duration;

use thiserror::Error;

/// Classifies relay errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No data arrived within the deadline budget
    Timeout,
    /// Malformed or unexpected bytes from a peer
    Protocol,
    /// The proxy could not be reached or refused the tunnel
    Connectivity,
    /// A line or field exceeded its fixed capacity
    Overflow,
    /// Syscall-level read/write failure, including an unexpected peer close
    Io,
    /// Caller-supplied value rejected before any network activity
    InvalidInput,
}

/// SMTP-over-SOCKS relay error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out after {waited:?}")]
    TimedOut { waited: Duration },

    #[error("no line terminator within {capacity} bytes")]
    Overflow { capacity: usize },

    #[error("connection closed by peer")]
    Closed,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("proxy {proxy} unreachable: {source}")]
    ProxyUnreachable {
        proxy: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS5 handshake failed: {0}")]
    ProxyHandshakeFailed(String),

    #[error("SOCKS5 connect rejected with reply code {0}")]
    ConnectRejected(u8),

    #[error("unsupported address type in SOCKS5 reply: {0}")]
    UnsupportedAddressType(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The error-kind class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TimedOut { .. } => ErrorKind::Timeout,
            Error::Overflow { .. } => ErrorKind::Overflow,
            Error::Closed | Error::Io(_) => ErrorKind::Io,
            Error::InvalidTarget(_) => ErrorKind::InvalidInput,
            Error::ProxyUnreachable { .. } | Error::ConnectRejected(_) => ErrorKind::Connectivity,
            Error::ProxyHandshakeFailed(_) | Error::UnsupportedAddressType(_) => {
                ErrorKind::Protocol
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// RFC 1928 text for a SOCKS5 reply code.
pub fn reply_description(rep: u8) -> &'static str {
    match rep {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "undefined",
    }
}

pub type Result<T> = std::result::Result<T, Error>;
