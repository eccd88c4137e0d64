//! Reference-counted per-key mutual exclusion.
//!
//! Maps an arbitrary string key to a binary semaphore plus an
//! outstanding-acquirer count. Entries exist only while someone holds or
//! waits on them, so unused keys cost nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Semaphore;

struct Entry {
    sem: Arc<Semaphore>,
    /// Holders plus waiters. The entry is destroyed when this drops to zero.
    acquirers: usize,
}

/// Per-key binary lock with lifetime tied to outstanding acquirers.
///
/// `acquire`/`release` are the explicit pair; [`KeyedMutex::lock`] is the
/// RAII flavor used by the TCP write path. Contenders on one key are served
/// FIFO. Releasing a key that was never acquired is a silent no-op.
pub struct KeyedMutex {
    entries: StdMutex<HashMap<String, Entry>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    /// Wait until the key is free, then hold it until [`release`](Self::release).
    pub async fn acquire(&self, key: &str) {
        let sem = self.enter(key);
        match sem.acquire().await {
            Ok(permit) => permit.forget(),
            // The semaphore is never closed; an error here means the entry
            // was torn down underneath us, in which case the key is free.
            Err(_) => {}
        };
    }

    /// Take the key only if it is free right now. Returns whether it was taken.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            sem: Arc::new(Semaphore::new(1)),
            acquirers: 0,
        });
        let acquired = match entry.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                entry.acquirers += 1;
                true
            }
            // A missing permit means another acquirer holds the key, so the
            // entry is guaranteed to outlive this call.
            Err(_) => false,
        };
        acquired
    }

    /// Release the key, waking the oldest waiter if any.
    pub fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.acquirers -= 1;
            if entry.acquirers == 0 {
                entries.remove(key);
            } else {
                entry.sem.add_permits(1);
            }
        }
    }

    /// RAII acquire: the key is released when the guard drops.
    pub async fn lock<'a>(&'a self, key: &str) -> KeyedGuard<'a> {
        self.acquire(key).await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
        }
    }

    /// Number of live entries. Used by tests to check reclamation.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(&self, key: &str) -> Arc<Semaphore> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            sem: Arc::new(Semaphore::new(1)),
            acquirers: 0,
        });
        entry.acquirers += 1;
        entry.sem.clone()
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one key of a [`KeyedMutex`]; releases on drop.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_release_reclaims_entry() {
        let m = KeyedMutex::new();
        m.acquire("a").await;
        assert_eq!(m.len(), 1);
        m.release("a");
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn release_without_acquire_is_noop() {
        let m = KeyedMutex::new();
        m.release("ghost");
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let m = KeyedMutex::new();
        m.acquire("a").await;
        // "b" must be immediately acquirable while "a" is held.
        assert!(m.try_acquire("b"));
        m.release("a");
        m.release("b");
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let m = KeyedMutex::new();
        m.acquire("k").await;
        assert!(!m.try_acquire("k"));
        m.release("k");
        assert!(m.try_acquire("k"));
        m.release("k");
    }

    #[tokio::test]
    async fn single_holder_per_key() {
        let m = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    m.acquire("shared").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_micros(50)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    m.release("shared");
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let m = KeyedMutex::new();
        {
            let _g = m.lock("k").await;
            assert_eq!(m.len(), 1);
        }
        assert!(m.is_empty());
    }
}
