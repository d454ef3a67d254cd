//! Embedded key/value store shared by the services of one server.
//!
//! One SQLite file per server, named after its public key. Values live in
//! named buckets; a bucket has to be created before it is written to.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::status::{Status, StatusReporter};
use crate::OverlayError;

/// Creates the bucket and value tables.
fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS buckets (
            name TEXT PRIMARY KEY
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv (
            bucket TEXT NOT NULL REFERENCES buckets(name),
            key BLOB NOT NULL,
            value BLOB NOT NULL,
            PRIMARY KEY (bucket, key)
        )",
        [],
    )?;
    Ok(())
}

pub struct KvStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl KvStore {
    /// Open (or create) `<dir>/<name>.db`.
    pub fn open(dir: &Path, name: &str) -> Result<Self, OverlayError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.db"));
        let conn = Connection::open(&path)?;
        create_tables(&conn)?;
        tracing::debug!("opened store {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// A store that lives only as long as this value.
    pub fn in_memory() -> Result<Self, OverlayError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `bucket` if it does not exist yet.
    pub fn create_bucket(&self, bucket: &str) -> Result<(), OverlayError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
            params![bucket],
        )?;
        Ok(())
    }

    pub fn has_bucket(&self, bucket: &str) -> Result<bool, OverlayError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM buckets WHERE name = ?1",
            params![bucket],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn buckets(&self) -> Result<Vec<String>, OverlayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM buckets ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), OverlayError> {
        if !self.has_bucket(bucket)? {
            return Err(OverlayError::Config(format!("bucket {bucket} does not exist")));
        }
        self.conn().execute(
            "INSERT OR REPLACE INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)",
            params![bucket, key, value],
        )?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, OverlayError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Returns whether the key existed.
    pub fn delete(&self, bucket: &str, key: &[u8]) -> Result<bool, OverlayError> {
        let removed = self.conn().execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(removed > 0)
    }

    pub fn keys(&self, bucket: &str) -> Result<Vec<Vec<u8>>, OverlayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE bucket = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![bucket], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
        Ok(keys)
    }
}

impl StatusReporter for KvStore {
    fn status(&self) -> Status {
        let mut status = Status::new();
        status.insert("Open".into(), "true".into());
        let buckets = self.buckets().map(|b| b.len()).unwrap_or(0);
        status.insert("Buckets".into(), buckets.to_string());
        status.insert(
            "Path".into(),
            self.path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".into()),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_explicit_and_idempotent() {
        let store = KvStore::in_memory().unwrap();
        assert!(store.put("svc", b"k", b"v").is_err());
        store.create_bucket("svc").unwrap();
        store.create_bucket("svc").unwrap();
        assert_eq!(store.buckets().unwrap(), vec!["svc".to_string()]);
    }

    #[test]
    fn put_get_delete() {
        let store = KvStore::in_memory().unwrap();
        store.create_bucket("svc").unwrap();
        store.put("svc", b"a", b"1").unwrap();
        store.put("svc", b"a", b"2").unwrap();
        store.put("svc", b"b", b"3").unwrap();
        assert_eq!(store.get("svc", b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.keys("svc").unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(store.delete("svc", b"a").unwrap());
        assert!(!store.delete("svc", b"a").unwrap());
        assert_eq!(store.get("svc", b"a").unwrap(), None);
    }

    #[test]
    fn buckets_do_not_share_keys() {
        let store = KvStore::in_memory().unwrap();
        store.create_bucket("a").unwrap();
        store.create_bucket("a_extra").unwrap();
        store.put("a", b"k", b"1").unwrap();
        assert_eq!(store.get("a_extra", b"k").unwrap(), None);
    }

    #[test]
    fn file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KvStore::open(dir.path(), "node").unwrap();
            store.create_bucket("svc").unwrap();
            store.put("svc", b"k", b"v").unwrap();
        }
        let store = KvStore::open(dir.path(), "node").unwrap();
        assert_eq!(store.get("svc", b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.path().unwrap(), dir.path().join("node.db"));
        assert_eq!(store.status()["Buckets"], "1");
    }
}
