//! Length-prefixed TCP framing engine.
//!
//! Architecture:
//! - `types` — shared framing constants and defaults
//! - `error` — categorized TCP error type
//! - `fragment` — the recycled per-connection fragment + receive state machine
//! - `stream` — plain/TLS split-half abstraction
//! - `tls` — client policy verifier and server acceptor
//! - `timer` — generation-counted idle timer
//! - `events` — per-event callback slots
//! - `connection` — connection handle, read loop, send paths
//! - `client` — dialing side
//! - `server` — accepting side with a capped client registry

pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod fragment;
pub mod server;
pub(crate) mod stream;
pub(crate) mod timer;
pub mod tls;
pub mod types;
