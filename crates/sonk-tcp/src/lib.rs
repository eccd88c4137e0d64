//! # SortOfNetKit – TCP
//!
//! Bidirectional, fragment-aware length-prefixed TCP framing with optional
//! TLS, idle timeouts, streaming file transfer, and server-side fan-out.

pub mod tcp;

pub use tcp::client::{TcpClient, TcpClientConfig};
pub use tcp::connection::{ConnectionRole, FileSendOptions, TcpConnection};
pub use tcp::error::{TcpError, TcpErrorKind, TcpResult};
pub use tcp::events::{ConnectionEvents, ServerEvents};
pub use tcp::fragment::Fragment;
pub use tcp::server::{TcpServer, TcpServerConfig};
pub use tcp::tls::{
    CertificateCheck, ChainStatus, ClientTlsOptions, ServerCertificate, ValidationDecision,
};
