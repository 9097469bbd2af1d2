//! Mutual exclusion keyed by parent resource.
//!
//! Sibling operations against one parent (for example every rule of one
//! server's firewall) must not interleave with each other. A [`KeyedLocks`]
//! is passed explicitly to whoever needs it; entries are created on first use
//! and pruned when the last holder or waiter goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    entries: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held while the keyed lock is owned. Released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    locks: Arc<KeyedLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(kind: &str, name: &str) -> String {
        format!("{}.{}", kind, name)
    }

    /// Acquire the lock for `name` of resource type `kind`, waiting for the
    /// current holder if there is one.
    pub async fn lock(self: &Arc<Self>, kind: &str, name: &str) -> KeyedGuard {
        let key = Self::key(kind, name);
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(entries.entry(key.clone()).or_default())
        };

        debug!("Waiting for lock {}", key);
        let guard = entry.lock_owned().await;
        debug!("Acquired lock {}", key);

        KeyedGuard {
            locks: Arc::clone(self),
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut entries = self.locks.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Release first so a waiter's clone is the only other reference left.
        drop(self.guard.take());
        if let Some(entry) = entries.get(&self.key) {
            // Only the map still holds it: no holder, no waiter.
            if Arc::strong_count(entry) == 1 {
                entries.remove(&self.key);
            }
        }
        debug!("Released lock {}", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let busy = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let locks = Arc::clone(&locks);
            let busy = Arc::clone(&busy);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("server", "db1").await;
                assert!(!busy.swap(true, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_millis(50)).await;
                busy.store(false, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let a = locks.lock("server", "db1").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("server", "db2"))
            .await
            .unwrap();
        assert_eq!(a.key(), "server.db1");
        assert_eq!(b.key(), "server.db2");
        assert_eq!(locks.len(), 2);

        drop(a);
        drop(b);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_kept_while_waiter_pending() {
        let locks = KeyedLocks::new();
        let first = locks.lock("server", "db1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("server", "db1").await;
            })
        };
        tokio::task::yield_now().await;

        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
