//! # SortOfNetKit – Instance
//!
//! Single-instance coordination: detect an already-running peer on a
//! loopback port and hand it the command-line arguments.

pub mod instance;

pub use instance::{SingleInstance, SingleInstanceConfig};
