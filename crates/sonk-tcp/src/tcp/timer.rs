//! Generation-counted idle timer.
//!
//! Armed while a read waits for bytes and retired as soon as the read
//! returns, so it measures the gap between successful reads. Firing
//! re-checks the generation so a pause that loses the race cannot produce
//! a spurious shutdown.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

type FireAction = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct IdleTimer {
    interval_ms: AtomicI64,
    generation: Arc<AtomicU64>,
    action: StdMutex<Option<FireAction>>,
}

impl IdleTimer {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms: AtomicI64::new(interval_ms),
            generation: Arc::new(AtomicU64::new(0)),
            action: StdMutex::new(None),
        }
    }

    /// Install the shutdown action. Set once, right after the owning
    /// connection is built.
    pub fn set_action(&self, action: impl Fn() + Send + Sync + 'static) {
        *self.action.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(action));
    }

    /// Retire any armed deadline.
    pub fn pause(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Arm a fresh deadline. No-op while the interval is disabled.
    pub fn resume(&self) {
        let interval = self.interval_ms.load(Ordering::SeqCst);
        if interval <= 0 {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let gen_counter = self.generation.clone();
        let action = self
            .action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(interval as u64)).await;
            if gen_counter.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Some(fire) = action {
                fire();
            }
        });
    }

    /// Change the interval. Zero or negative disables and retires the
    /// timer; a positive value arms it right away.
    pub fn set_interval(&self, interval_ms: i64) {
        self.interval_ms.store(interval_ms, Ordering::SeqCst);
        if interval_ms <= 0 {
            self.pause();
        } else {
            self.resume();
        }
    }

    pub fn interval(&self) -> i64 {
        self.interval_ms.load(Ordering::SeqCst)
    }
}
