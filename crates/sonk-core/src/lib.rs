//! # SortOfNetKit – Core
//!
//! Shared concurrency and resource primitives used across the toolkit:
//! - `keyed_mutex` — reference-counted per-key mutual exclusion
//! - `progress` — transfer progress with a once-per-second byte-rate sampler
//! - `cancel` — cooperative cancellation token

pub mod cancel;
pub mod keyed_mutex;
pub mod progress;

pub use cancel::CancelToken;
pub use keyed_mutex::{KeyedGuard, KeyedMutex};
pub use progress::{ProgressMonitor, ProgressSnapshot};
