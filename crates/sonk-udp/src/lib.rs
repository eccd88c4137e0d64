//! # SortOfNetKit – UDP
//!
//! Single-socket datagram send/receive with a toggleable listen loop.

pub mod handler;

pub use handler::{Datagram, UdpError, UdpHandler, UdpHandlerConfig, UdpResult};
