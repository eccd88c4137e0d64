//! FTP-specific error type.

use std::fmt;

/// Categorized FTP error, optionally carrying the reply code that caused it.
#[derive(Debug, Clone)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / DNS failure on the control or data connection.
    ConnectionFailed,
    /// AUTH TLS or handshake failure.
    TlsFailed,
    /// Login rejected.
    AuthFailed,
    /// The server answered a command with 4xx/5xx.
    CommandRejected,
    /// PASV/PORT could not establish the data channel.
    DataChannelFailed,
    /// Transfer aborted or incomplete.
    TransferFailed,
    /// Un-parseable server output.
    ProtocolError,
    /// Local I/O failure.
    IoError,
    /// Operation timed out.
    Timeout,
    /// Cooperative cancellation observed at a checkpoint.
    Cancelled,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(FtpErrorKind::Cancelled, "operation cancelled")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Classify a reply code into the closest error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::ConnectionFailed,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 | 532 => FtpErrorKind::AuthFailed,
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            _ => FtpErrorKind::CommandRejected,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
        }
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(e.to_string())
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<native_tls::Error> for FtpError {
    fn from(e: native_tls::Error) -> Self {
        Self::tls_failed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_classify() {
        assert_eq!(
            FtpError::from_reply(530, "Login incorrect").kind,
            FtpErrorKind::AuthFailed
        );
        assert_eq!(
            FtpError::from_reply(425, "Can't open data connection").kind,
            FtpErrorKind::DataChannelFailed
        );
        assert_eq!(
            FtpError::from_reply(552, "Quota exceeded").kind,
            FtpErrorKind::TransferFailed
        );
        assert_eq!(
            FtpError::from_reply(500, "Unknown command").kind,
            FtpErrorKind::CommandRejected
        );
    }

    #[test]
    fn display_includes_code() {
        let err = FtpError::from_reply(550, "No such file");
        let text = err.to_string();
        assert!(text.contains("550"));
        assert!(text.contains("No such file"));
    }
}
