//! In-memory ordered store

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use super::{now_millis, KvStream, Mutation, Store, WriteOptions};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// `BTreeMap`-backed store, used by tests and ephemeral nodes
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        let now = now_millis();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &[u8], value: &[u8], options: &WriteOptions) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at: options.expires_at(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<Mutation>, options: &WriteOptions) -> Result<()> {
        let expires_at = options.expires_at();
        let mut entries = self.entries.write().await;
        for op in ops {
            match op {
                Mutation::Put { key, value } => {
                    entries.insert(key, Entry { value, expires_at });
                }
                Mutation::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn range(&self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvStream> {
        if upper.map_or(false, |u| u <= lower) {
            return Ok(stream::empty().boxed());
        }

        let entries = self.entries.read().await;
        let now = now_millis();
        let upper = match upper {
            Some(u) => Bound::Excluded(u.to_vec()),
            None => Bound::Unbounded,
        };
        let rows: Vec<_> = entries
            .range((Bound::Included(lower.to_vec()), upper))
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| Ok((k.clone(), e.value.clone())))
            .collect();

        Ok(stream::iter(rows).boxed())
    }

    async fn is_empty(&self) -> Result<bool> {
        let entries = self.entries.read().await;
        let now = now_millis();
        Ok(!entries.values().any(|e| e.is_live(now)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let now = now_millis();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}
