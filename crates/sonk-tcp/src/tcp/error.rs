//! TCP-specific error type.

use std::fmt;

/// Categorized TCP error.
#[derive(Debug, Clone)]
pub struct TcpError {
    pub kind: TcpErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpErrorKind {
    /// Connect or accept failed.
    Dial,
    /// TLS handshake or certificate validation failed.
    Tls,
    /// Mid-stream read failure other than clean EOF or our own disconnect.
    Receive,
    /// The length header decoded to something unusable. Fatal for the
    /// connection.
    Framing,
    /// Operation attempted without a live connection.
    NotConnected,
    /// Write-side or local I/O failure.
    Io,
}

pub type TcpResult<T> = Result<T, TcpError>;

impl TcpError {
    pub fn new(kind: TcpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn dial(msg: impl Into<String>) -> Self {
        Self::new(TcpErrorKind::Dial, msg)
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::new(TcpErrorKind::Tls, msg)
    }

    pub fn receive(msg: impl Into<String>) -> Self {
        Self::new(TcpErrorKind::Receive, msg)
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        Self::new(TcpErrorKind::Framing, msg)
    }

    pub fn not_connected() -> Self {
        Self::new(TcpErrorKind::NotConnected, "not connected")
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(TcpErrorKind::Io, msg)
    }
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[TCP {:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for TcpError {}

impl From<std::io::Error> for TcpError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}
