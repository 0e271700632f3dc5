//! SQLite-backed store
//!
//! Durable local engine for the daemon. Keys are BLOBs, which SQLite
//! orders with memcmp, so range scans come back in byte order.

use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{now_millis, KvStream, Mutation, Store, WriteOptions};
use crate::error::{Error, Result};

/// Rows fetched per range-scan page
const PAGE_SIZE: usize = 256;

type Row = (Vec<u8>, Vec<u8>);

/// Persistent store backed by SQLite
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_kv_expires
                ON kv(expires_at) WHERE expires_at IS NOT NULL;
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn fetch_page(
    conn: &Connection,
    from: &[u8],
    inclusive: bool,
    upper: Option<&[u8]>,
) -> rusqlite::Result<Vec<Row>> {
    let cmp = if inclusive { ">=" } else { ">" };
    let now = now_millis();
    let limit = PAGE_SIZE as i64;
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Row> {
        Ok((row.get(0)?, row.get(1)?))
    };

    match upper {
        Some(upper) => {
            let sql = format!(
                "SELECT key, value FROM kv WHERE key {} ?1 AND key < ?2 \
                 AND (expires_at IS NULL OR expires_at > ?3) ORDER BY key LIMIT ?4",
                cmp
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![from, upper, now, limit], map_row)?;
            rows.collect()
        }
        None => {
            let sql = format!(
                "SELECT key, value FROM kv WHERE key {} ?1 \
                 AND (expires_at IS NULL OR expires_at > ?2) ORDER BY key LIMIT ?3",
                cmp
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![from, now, limit], map_row)?;
            rows.collect()
        }
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn put(&self, key: &[u8], value: &[u8], options: &WriteOptions) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, options.expires_at()],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn batch(&self, ops: Vec<Mutation>, options: &WriteOptions) -> Result<()> {
        let expires_at = options.expires_at();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for op in &ops {
            match op {
                Mutation::Put { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                        params![key, value, expires_at],
                    )?;
                }
                Mutation::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn range(&self, lower: &[u8], upper: Option<&[u8]>) -> Result<KvStream> {
        let conn = Arc::clone(&self.conn);
        let upper = upper.map(<[u8]>::to_vec);

        // Each page resumes strictly after the last key of the previous one
        let pages = stream::try_unfold(Some((lower.to_vec(), true)), move |cursor| {
            let conn = Arc::clone(&conn);
            let upper = upper.clone();
            async move {
                let Some((from, inclusive)) = cursor else {
                    return Ok(None);
                };
                let rows = {
                    let conn = conn.lock().await;
                    fetch_page(&conn, &from, inclusive, upper.as_deref())?
                };
                if rows.is_empty() {
                    return Ok(None);
                }
                let next = if rows.len() < PAGE_SIZE {
                    None
                } else {
                    rows.last().map(|(k, _)| (k.clone(), false))
                };
                Ok::<_, Error>(Some((rows, next)))
            }
        });

        Ok(pages
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .boxed())
    }

    async fn is_empty(&self) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM kv WHERE expires_at IS NULL OR expires_at > ?1)",
            params![now_millis()],
            |row| row.get(0),
        )?;
        Ok(!exists)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_millis()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::scan;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_basic() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("kv.db")).unwrap();
        assert!(store.is_empty().await.unwrap());

        store.put(b"k", b"v", &WriteOptions::default()).await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert!(!store.is_empty().await.unwrap());

        store.delete(b"k").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .batch(
                    vec![Mutation::put("a", "1"), Mutation::put("b", "2")],
                    &WriteOptions::default(),
                )
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_sqlite_range_pages_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ops: Vec<_> = (0..(PAGE_SIZE * 2 + 7))
            .map(|i| Mutation::put(format!("key{:05}", i), "v"))
            .collect();
        store.batch(ops, &WriteOptions::default()).await.unwrap();
        store.put(b"other", b"v", &WriteOptions::default()).await.unwrap();

        let rows = scan(&store, b"key", Some(&b"key~"[..])).await.unwrap();
        assert_eq!(rows.len(), PAGE_SIZE * 2 + 7);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(rows[0].0, b"key00000".to_vec());
    }

    #[tokio::test]
    async fn test_sqlite_binary_keys_sort_bytewise() {
        let store = SqliteStore::open_in_memory().unwrap();
        for key in [&b"\xff\x01"[..], b"a", b"\x00"] {
            store.put(key, b"v", &WriteOptions::default()).await.unwrap();
        }
        let keys: Vec<_> = scan(&store, b"", None)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"\x00".to_vec(), b"a".to_vec(), b"\xff\x01".to_vec()]);
    }
}
