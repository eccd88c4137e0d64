//! Framing constants and config defaults shared across the crate.

/// Bytes reserved at the front of every receive buffer for the in-progress
/// length header. Large enough for the 64-bit flavor.
pub const HEADER_RESERVE: usize = 8;

/// Size of the 32-bit length header used for byte sends.
pub const SHORT_HEADER: usize = 4;

/// Size of the 64-bit length header used for file sends.
pub const LONG_HEADER: usize = 8;

/// Cap on up-front accumulator allocation; packets larger than this grow
/// the accumulator as bytes arrive instead of trusting the header.
pub const MAX_PREALLOC: usize = 1 << 20;

pub fn default_buffer_size() -> usize {
    4096
}

pub fn default_connect_timeout() -> u64 {
    15
}

pub fn default_max_clients() -> usize {
    1024
}
