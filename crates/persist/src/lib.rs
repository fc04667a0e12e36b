//! kapply persistence: inventory records in a local SQLite file, for runs
//! that should not write bookkeeping into the cluster.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use kapply_core::{RecordStore, StoreError};
use metrics::{counter, histogram};
use tracing::debug;

/// Stored versions kept per record; older ones are rotated out on write.
const HISTORY_DEPTH: i64 = 3;

/// One stored version of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVersion {
    pub ts: i64,
    pub blob: String,
}

/// SQLite-backed [`RecordStore`]. Synchronous under a mutex; record access is
/// a handful of small statements per run.
pub struct SqliteRecordStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteRecordStore {
    /// Open `KAPPLY_DB_PATH`, or `~/.kapply/inventory.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KAPPLY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS inventory_records (
                name      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                blob      BLOB NOT NULL
            )",
            [],
        )
        .context("creating inventory_records table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_inventory_records_key ON inventory_records(namespace, name)",
            [],
        )
        .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored versions of a record, most recently written first. Write order
    /// decides, not `ts`, so a clock step back cannot resurrect an old blob.
    pub fn history(&self, name: &str, namespace: &str, limit: usize) -> Result<Vec<RecordVersion>> {
        let started = std::time::Instant::now();
        let db = self.lock();
        let mut stmt = db.prepare(
            "SELECT ts, blob FROM inventory_records WHERE namespace = ?1 AND name = ?2
             ORDER BY rowid DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query((namespace, name, limit as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            out.push(RecordVersion { ts, blob: maybe_decompress(&blob) });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn put(&self, name: &str, namespace: &str, blob: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.lock();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO inventory_records(name, namespace, ts, blob) VALUES (?1, ?2, ?3, ?4)",
            (name, namespace, now_ts(), maybe_compress(blob)),
        )?;
        tx.execute(
            "DELETE FROM inventory_records
             WHERE namespace = ?1 AND name = ?2
               AND rowid NOT IN (
                   SELECT rowid FROM inventory_records WHERE namespace = ?1 AND name = ?2
                   ORDER BY rowid DESC LIMIT ?3
               )",
            (namespace, name, HISTORY_DEPTH),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn remove(&self, name: &str, namespace: &str) -> Result<usize> {
        let db = self.lock();
        let n = db.execute("DELETE FROM inventory_records WHERE namespace = ?1 AND name = ?2", (namespace, name))?;
        Ok(n)
    }
}

fn backend(name: &str, namespace: &str, e: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("inventory record {}/{}: {:#}", namespace, name, e))
}

#[async_trait::async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get_record(&self, name: &str, namespace: &str) -> Result<Option<String>, StoreError> {
        let mut latest = self.history(name, namespace, 1).map_err(|e| backend(name, namespace, e))?;
        Ok(latest.pop().map(|v| v.blob))
    }

    async fn put_record(&self, name: &str, namespace: &str, blob: &str) -> Result<(), StoreError> {
        self.put(name, namespace, blob).map_err(|e| backend(name, namespace, e))?;
        debug!(record = %format!("{}/{}", namespace, name), bytes = blob.len(), "inventory record saved");
        Ok(())
    }

    async fn delete_record(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        match self.remove(name, namespace).map_err(|e| backend(name, namespace, e))? {
            0 => Err(StoreError::NotFound(format!("inventory record {}/{}", namespace, name))),
            _ => Ok(()),
        }
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kapply");
        let _ = std::fs::create_dir_all(&p);
        p.push("inventory.db");
        return p.to_string_lossy().to_string();
    }
    "kapply-inventory.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KAPPLY_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "kapply-test-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn put_get_overwrites_and_rotates() {
        let s = SqliteRecordStore::open(&temp_db()).unwrap();
        assert_eq!(s.get_record("inv", "default").await.unwrap(), None);
        for i in 0..5 {
            s.put_record("inv", "default", &format!("blob-{}", i)).await.unwrap();
        }
        assert_eq!(s.get_record("inv", "default").await.unwrap().as_deref(), Some("blob-4"));
        let hist = s.history("inv", "default", 10).unwrap();
        let blobs: Vec<_> = hist.iter().map(|v| v.blob.as_str()).collect();
        assert_eq!(blobs, vec!["blob-4", "blob-3", "blob-2"]);
    }

    #[tokio::test]
    async fn records_are_keyed_by_name_and_namespace() {
        let s = SqliteRecordStore::open(&temp_db()).unwrap();
        s.put_record("inv", "a", "in-a").await.unwrap();
        s.put_record("inv", "b", "in-b").await.unwrap();
        assert_eq!(s.get_record("inv", "a").await.unwrap().as_deref(), Some("in-a"));
        assert_eq!(s.get_record("inv", "b").await.unwrap().as_deref(), Some("in-b"));

        s.delete_record("inv", "a").await.unwrap();
        assert_eq!(s.get_record("inv", "a").await.unwrap(), None);
        assert!(s.delete_record("inv", "a").await.unwrap_err().is_not_found());
        assert_eq!(s.get_record("inv", "b").await.unwrap().as_deref(), Some("in-b"));
    }

    #[tokio::test]
    async fn latest_write_wins_over_timestamps() {
        let s = SqliteRecordStore::open(&temp_db()).unwrap();
        s.lock()
            .execute(
                "INSERT INTO inventory_records(name, namespace, ts, blob) VALUES ('inv', 'default', ?1, ?2)",
                (now_ts() + 3600, maybe_compress("from-the-future")),
            )
            .unwrap();
        s.put_record("inv", "default", "current").await.unwrap();
        assert_eq!(s.get_record("inv", "default").await.unwrap().as_deref(), Some("current"));
        for i in 0..3 {
            s.put_record("inv", "default", &format!("next-{}", i)).await.unwrap();
        }
        let blobs: Vec<_> = s.history("inv", "default", 10).unwrap().into_iter().map(|v| v.blob).collect();
        assert_eq!(blobs, vec!["next-2", "next-1", "next-0"]);
    }

    #[test]
    fn compression_round_trips_text() {
        let text = "{\"source\":\"kapply\",\"entries\":[]}";
        assert_eq!(maybe_decompress(&maybe_compress(text)), text);
    }
}
