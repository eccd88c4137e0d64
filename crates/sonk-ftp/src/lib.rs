//! # SortOfNetKit – FTP
//!
//! FTP verb orchestration over an async control/data channel stack:
//! streaming downloads and uploads with progress and cancellation, grouped
//! session reuse, and explicit FTPS via the request hook.

pub mod ftp;

pub use ftp::error::{FtpError, FtpErrorKind, FtpResult};
pub use ftp::handler::FtpHandler;
pub use ftp::types::{
    FtpCredentials, FtpEntry, FtpEntryKind, FtpOptions, FtpReply, FtpRequest, FtpSecurityMode,
    FtpVerb,
};
