//! Transfer progress with a once-per-second byte-rate sampler.
//!
//! Reads add to both the running total and a window counter; a spawned
//! sampler task copies the window into `bytes_per_second` every second,
//! resets it, and fires the rate callback.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable view of a monitor's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Total bytes expected, or -1 when unknown.
    pub total_length: i64,
    pub current_count: u64,
    pub bytes_per_second: u64,
    /// Whole percent, or -1 when the total is unknown.
    pub percent: i32,
}

type InitCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;
type RateCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_init: Option<InitCallback>,
    on_progress: Option<ProgressCallback>,
    on_rate: Option<RateCallback>,
}

struct Inner {
    total_length: AtomicI64,
    current_count: AtomicU64,
    bytes_per_second: AtomicU64,
    /// Bytes accumulated since the last sampler tick.
    window: StdMutex<u64>,
    /// Bumped to retire an outstanding sampler task.
    generation: AtomicU64,
    callbacks: StdMutex<Callbacks>,
}

/// Cloneable progress monitor; all clones share one set of counters.
#[derive(Clone)]
pub struct ProgressMonitor {
    inner: Arc<Inner>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                total_length: AtomicI64::new(-1),
                current_count: AtomicU64::new(0),
                bytes_per_second: AtomicU64::new(0),
                window: StdMutex::new(0),
                generation: AtomicU64::new(0),
                callbacks: StdMutex::new(Callbacks::default()),
            }),
        }
    }

    // ── Callback registration ────────────────────────────────────────

    pub fn on_init(&self, f: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) {
        self.callbacks(|c| c.on_init = Some(Arc::new(f)));
    }

    pub fn on_progress(&self, f: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) {
        self.callbacks(|c| c.on_progress = Some(Arc::new(f)));
    }

    pub fn on_rate_updated(&self, f: impl Fn(u64) + Send + Sync + 'static) {
        self.callbacks(|c| c.on_rate = Some(Arc::new(f)));
    }

    // ── Counters ─────────────────────────────────────────────────────

    /// Reset the counters for a new transfer and fire the init callback.
    /// Pass -1 when the total is unknown.
    pub fn init(&self, total_length: i64) {
        self.inner.total_length.store(total_length, Ordering::SeqCst);
        self.inner.current_count.store(0, Ordering::SeqCst);
        self.inner.bytes_per_second.store(0, Ordering::SeqCst);
        *self.inner.window.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        let snap = self.snapshot();
        if let Some(f) = self.callback(|c| c.on_init.clone()) {
            f(&snap);
        }
    }

    /// Record `n` transferred bytes.
    pub fn add(&self, n: u64) {
        self.inner.current_count.fetch_add(n, Ordering::SeqCst);
        *self.inner.window.lock().unwrap_or_else(|e| e.into_inner()) += n;
        let snap = self.snapshot();
        if let Some(f) = self.callback(|c| c.on_progress.clone()) {
            f(&snap);
        }
    }

    pub fn total_length(&self) -> i64 {
        self.inner.total_length.load(Ordering::SeqCst)
    }

    pub fn current_count(&self) -> u64 {
        self.inner.current_count.load(Ordering::SeqCst)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.inner.bytes_per_second.load(Ordering::SeqCst)
    }

    /// Whole percent complete, or -1 when the total is unknown.
    pub fn percent(&self) -> i32 {
        let total = self.total_length();
        if total < 0 {
            return -1;
        }
        if total == 0 {
            return 100;
        }
        ((self.current_count() as i64 * 100) / total) as i32
    }

    pub fn completed(&self) -> bool {
        let total = self.total_length();
        total >= 0 && self.current_count() == total as u64
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_length: self.total_length(),
            current_count: self.current_count(),
            bytes_per_second: self.bytes_per_second(),
            percent: self.percent(),
        }
    }

    // ── Sampler ──────────────────────────────────────────────────────

    /// Start the one-second rate sampler. A prior sampler, if any, is retired.
    pub fn start_sampler(&self) {
        self.start_sampler_with_period(Duration::from_secs(1));
    }

    /// Sampler with a custom period; tests shorten it.
    pub fn start_sampler_with_period(&self, period: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let sampled = {
                    let mut window = inner.window.lock().unwrap_or_else(|e| e.into_inner());
                    std::mem::take(&mut *window)
                };
                inner.bytes_per_second.store(sampled, Ordering::SeqCst);
                let cb = inner
                    .callbacks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_rate
                    .clone();
                if let Some(f) = cb {
                    f(sampled);
                }
            }
        });
    }

    /// Stop the sampler. Idempotent.
    pub fn stop_sampler(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn callbacks(&self, set: impl FnOnce(&mut Callbacks)) {
        set(&mut self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn callback<T>(&self, get: impl FnOnce(&Callbacks) -> Option<T>) -> Option<T> {
        get(&self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}
