//! Local scratch caches: an ordered key -> value store with prefix scans.
//!
//! The engine behind the store is deliberately boring; the contract is what
//! matters. Scans materialize a snapshot of the matching range at call time,
//! so an iterator never observes writes made after it was taken. One handle
//! owns each cache; concurrent readers go through the same handle.
//!
//! Namespaces are prefix-partitioned: `__delta__`, `__packfile__`,
//! `__deleted__`, `__file__`, `__directory__`, `__summary__`, `__error__`,
//! `__xattr__`, with a `:` between the namespace and the key proper.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All pairs whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Same range, descending. Deepest-first directory rollup needs this.
    fn scan_prefix_rev(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory store for tests and short-lived scratch state.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock().unwrap();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_prefix_rev(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = self.scan_prefix(prefix)?;
        pairs.reverse();
        Ok(pairs)
    }
}

/// SQLite-backed store for scan caches that outlive one process's memory
/// budget. `WITHOUT ROWID` keeps the table clustered by key, which makes
/// the prefix scans an index walk.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &camino::Utf8Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Couldn't open cache database {path}"))?;
        Self::init(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 key   BLOB PRIMARY KEY,
                 value BLOB NOT NULL
             ) WITHOUT ROWID;",
        )
        .context("Couldn't create the cache schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn scan(&self, prefix: &[u8], ascending: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock().unwrap();
        let sql = if ascending {
            "SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key ASC"
        } else {
            "SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key DESC"
        };
        let mut stmt = conn.prepare_cached(sql).map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(sqlite_err)?;

        let mut pairs = Vec::new();
        for row in rows {
            let (key, value) = row.map_err(sqlite_err)?;
            if !key.starts_with(prefix) {
                if ascending {
                    break;
                }
                continue;
            }
            pairs.push((key, value));
        }
        Ok(pairs)
    }
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::Io(std::io::Error::other(e))
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("SELECT value FROM kv WHERE key = ?1")
            .map_err(sqlite_err)?;
        stmt.query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()
            .map_err(sqlite_err)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")
            .map_err(sqlite_err)?
            .execute(params![key, value])
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM kv WHERE key = ?1")
            .map_err(sqlite_err)?
            .execute(params![key])
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(prefix, true)
    }

    fn scan_prefix_rev(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(prefix, false)
    }
}

/// Build a namespaced key: `__file__` + `:` + `/some/path`.
pub fn namespaced(namespace: &str, key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(namespace.len() + 1 + key.len());
    full.extend_from_slice(namespace.as_bytes());
    full.push(b':');
    full.extend_from_slice(key);
    full
}

/// Strip a namespace prefix off a key returned by a scan.
pub fn strip_namespace<'a>(namespace: &str, key: &'a [u8]) -> &'a [u8] {
    &key[namespace.len() + 1..]
}

pub mod namespaces {
    pub const DELTA: &str = "__delta__";
    pub const PACKFILE: &str = "__packfile__";
    pub const DELETED: &str = "__deleted__";
    pub const CONFIGURATION: &str = "__configuration__";
    pub const SNAPSHOT: &str = "__snapshot__";
    pub const FILE: &str = "__file__";
    pub const DIRECTORY: &str = "__directory__";
    pub const SUMMARY: &str = "__summary__";
    pub const ERROR: &str = "__error__";
    pub const XATTR: &str = "__xattr__";
    pub const INDEX: &str = "__index__";
    pub const STATE: &str = "__state__";
}

#[cfg(test)]
mod test {
    use super::*;

    fn exercise(store: &dyn KvStore) -> Result<()> {
        store.put(b"__file__:/a", b"1")?;
        store.put(b"__file__:/b", b"2")?;
        store.put(b"__file__:/b/c", b"3")?;
        store.put(b"__directory__:/", b"root")?;

        assert_eq!(store.get(b"__file__:/a")?, Some(b"1".to_vec()));
        assert_eq!(store.get(b"__file__:/missing")?, None);

        let files = store.scan_prefix(b"__file__:")?;
        assert_eq!(
            files.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(),
            vec![
                b"__file__:/a".as_slice(),
                b"__file__:/b".as_slice(),
                b"__file__:/b/c".as_slice()
            ]
        );

        let reversed = store.scan_prefix_rev(b"__file__:")?;
        assert_eq!(reversed[0].0, b"__file__:/b/c".to_vec());

        store.delete(b"__file__:/a")?;
        assert_eq!(store.get(b"__file__:/a")?, None);
        assert_eq!(store.scan_prefix(b"__file__:")?.len(), 2);

        // Scans already taken don't see later writes.
        let before = store.scan_prefix(b"__directory__:")?;
        store.put(b"__directory__:/new", b"later")?;
        assert_eq!(before.len(), 1);
        Ok(())
    }

    #[test]
    fn memory_store() -> Result<()> {
        exercise(&MemoryStore::new())
    }

    #[test]
    fn sqlite_store() -> anyhow::Result<()> {
        exercise(&SqliteStore::in_memory()?)?;
        Ok(())
    }

    #[test]
    fn namespacing() {
        let key = namespaced(namespaces::FILE, b"/etc/passwd");
        assert_eq!(key, b"__file__:/etc/passwd");
        assert_eq!(strip_namespace(namespaces::FILE, &key), b"/etc/passwd");
    }
}
