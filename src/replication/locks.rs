//! Per-key session locks
//!
//! Sessions touching overlapping keys on the same coordinator run one
//! after another. Locks are taken in key order, so two sessions can never
//! wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type LockTable = HashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>;

/// Table of in-flight key locks
#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<LockTable>,
}

/// Held locks; released on drop
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    keys: Vec<Vec<u8>>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key, waiting for sessions that hold any of them
    pub async fn lock<'k>(&self, keys: impl IntoIterator<Item = &'k [u8]>) -> KeyGuard<'_> {
        let mut keys: Vec<Vec<u8>> = keys.into_iter().map(<[u8]>::to_vec).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let mutex = {
                let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(table.entry(key.clone()).or_default())
            };
            guards.push(mutex.lock_owned().await);
        }

        KeyGuard {
            locks: self,
            keys,
            guards,
        }
    }

    /// Number of keys with a holder or waiter
    pub fn in_flight(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut table = self.locks.table.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            // Only the table's own reference left: nobody holds or waits
            if table.get(key).map_or(false, |m| Arc::strong_count(m) == 1) {
                table.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_release_cleans_table() {
        let locks = KeyLocks::new();
        {
            let _guard = locks.lock([&b"a"[..], b"b", b"a"]).await;
            assert_eq!(locks.in_flight(), 2);
        }
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_sessions_serialize() {
        let locks = Arc::new(KeyLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = locks.lock([&b"k"[..]]).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock([&b"x"[..], b"k"]).await;
                order.lock().unwrap().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().unwrap().push("first");
        drop(guard);

        waiter.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock([&b"a"[..]]).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock([&b"b"[..]])).await;
        assert!(b.is_ok());
    }
}
