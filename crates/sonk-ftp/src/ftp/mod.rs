//! FTP orchestrator.
//!
//! Architecture:
//! - `types` — options, request/reply types, listing entries
//! - `error` — categorized FTP error type
//! - `protocol` — low-level control-channel codec
//! - `connection` — control-connection dialing
//! - `tls` — AUTH TLS upgrade and FTPS data-channel wrapping
//! - `transfer` — PASV/PORT data channels
//! - `parser` — LIST output parsing
//! - `session` — a logged-in control session and its verbs
//! - `pool` — grouped session reuse with a per-group connection cap
//! - `handler` — the verb orchestrator with streaming transfer loops

pub mod connection;
pub mod error;
pub mod handler;
pub mod parser;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod transfer;
pub mod types;
