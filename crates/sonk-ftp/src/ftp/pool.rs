//! Grouped session reuse with a per-group connection cap.
//!
//! Sessions are keyed by the options' group (explicit `groupName`, or the
//! host). Each group carries a semaphore sized by `connectionsLimit`; a
//! permit is held for the whole request, capping concurrent control
//! connections per group. `keepAlive` decides whether a finished session
//! returns to the group or QUITs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::ftp::session::FtpSession;

/// Keep-alive sessions idle beyond this are not reused.
const IDLE_REAP_SECS: i64 = 300;

struct Group {
    idle: Vec<FtpSession>,
    sem: Arc<Semaphore>,
}

pub(crate) struct FtpPool {
    groups: StdMutex<HashMap<String, Group>>,
}

impl FtpPool {
    pub fn new() -> Self {
        Self {
            groups: StdMutex::new(HashMap::new()),
        }
    }

    /// Wait for a slot in the group. The semaphore is sized from the limit
    /// in force when the group is first used.
    pub async fn permit(&self, group: &str, limit: usize) -> OwnedSemaphorePermit {
        let sem = {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            groups
                .entry(group.to_string())
                .or_insert_with(|| Group {
                    idle: Vec::new(),
                    sem: Arc::new(Semaphore::new(limit.max(1))),
                })
                .sem
                .clone()
        };
        match sem.acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => unreachable!("pool semaphore closed"),
        }
    }

    /// Grab an idle session from the group, if a fresh one survived.
    /// Sessions idle past the reap window are dropped instead of reused;
    /// their sockets close on drop.
    pub fn take_idle(&self, group: &str) -> Option<FtpSession> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(IDLE_REAP_SECS);
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups.get_mut(group)?;
        while let Some(session) = group.idle.pop() {
            if session.last_used >= cutoff {
                return Some(session);
            }
            log::debug!("[ftp:{}] reaping idle session", session.id);
        }
        None
    }

    /// Return a session after a request. Healthy keep-alive sessions go
    /// back to the group; everything else QUITs.
    pub async fn finish(&self, mut session: FtpSession, keep_alive: bool, healthy: bool) {
        if keep_alive && healthy && session.connected {
            session.touch();
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(group) = groups.get_mut(&session.group) {
                group.idle.push(session);
                return;
            }
        }
        let _ = session.quit().await;
    }

    /// QUIT and drop every idle session.
    pub async fn drain(&self) {
        let idle: Vec<FtpSession> = {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            groups
                .values_mut()
                .flat_map(|g| g.idle.drain(..))
                .collect()
        };
        for mut session in idle {
            let _ = session.quit().await;
        }
    }

    pub fn idle_count(&self, group: &str) -> usize {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group)
            .map(|g| g.idle.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_cap_concurrency_per_group() {
        let pool = Arc::new(FtpPool::new());
        let first = pool.permit("g", 1).await;
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.permit("g", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished(), "second permit granted past the cap");
        drop(first);
        let _ = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second permit never granted");
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let pool = FtpPool::new();
        let _a = pool.permit("a", 1).await;
        // A different group must not contend.
        let _b = tokio::time::timeout(Duration::from_millis(200), pool.permit("b", 1))
            .await
            .expect("group b blocked by group a");
    }

    #[test]
    fn take_idle_from_empty_group() {
        let pool = FtpPool::new();
        assert!(pool.take_idle("nothing").is_none());
        assert_eq!(pool.idle_count("nothing"), 0);
    }
}
