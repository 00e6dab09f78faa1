//! SQLite-backed key-value store.
//!
//! One `kv` table; every [`WriteBatch`] runs inside a single `IMMEDIATE`
//! transaction, so several processes can share one database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use super::{projected_size, BatchOp, StorageBackend, StorageError, StorageResult, WriteBatch};

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    quota_bytes: Option<u64>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key   TEXT PRIMARY KEY NOT NULL,
        value BLOB NOT NULL
    );
";

/// How long a writer waits for another connection's transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl SqliteBackend {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!(
                    "Failed to create storage directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Self::init(conn, None)
    }

    /// In-memory database, for tests and ephemeral runs
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init(conn, None)
    }

    /// Cap the total stored bytes
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    fn init(conn: Connection, quota_bytes: Option<u64>) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;

        // Fail early on a damaged file rather than on the first write
        let status: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(map_sqlite_error)?;
        if status != "ok" {
            return Err(StorageError::Corrupt(status));
        }

        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("sqlite connection poisoned".to_string()))
    }

    fn apply(&self, tx: &Transaction<'_>, batch: &WriteBatch) -> StorageResult<()> {
        if let Some(quota) = self.quota_bytes {
            let current = used_bytes_in(tx)?;
            let projected = projected_size(current, batch, |key| entry_size_in(tx, key))?;
            if projected > quota {
                return Err(StorageError::QuotaExceeded {
                    needed: projected.saturating_sub(current),
                    available: quota.saturating_sub(current),
                });
            }
        }

        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )
                    .map_err(map_sqlite_error)?;
                }
                BatchOp::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                        .map_err(map_sqlite_error)?;
                }
            }
        }
        Ok(())
    }
}

fn begin(conn: &mut Connection) -> StorageResult<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sqlite_error)
}

fn map_sqlite_error(err: rusqlite::Error) -> StorageError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => StorageError::QuotaExceeded {
            needed: 0,
            available: 0,
        },
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StorageError::Corrupt(err.to_string())
        }
        _ => StorageError::Unavailable(err.to_string()),
    }
}

fn used_bytes_in(conn: &Connection) -> StorageResult<u64> {
    let used: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv",
            [],
            |row| row.get(0),
        )
        .map_err(map_sqlite_error)?;
    Ok(used.max(0) as u64)
}

fn entry_size_in(conn: &Connection, key: &str) -> StorageResult<Option<u64>> {
    let size = conn
        .query_row(
            "SELECT LENGTH(key) + LENGTH(value) FROM kv WHERE key = ?1",
            params![key],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(map_sqlite_error)?;
    Ok(size.map(|size| size.max(0) as u64))
}

fn value_in(conn: &Connection, key: &str) -> StorageResult<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT value FROM kv WHERE key = ?1",
        params![key],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()
    .map_err(map_sqlite_error)
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        value_in(&conn, key)
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )
            .map_err(map_sqlite_error)?;

        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(map_sqlite_error)?;

        let entries = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlite_error)?;
        Ok(entries)
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = begin(&mut conn)?;
        self.apply(&tx, &batch)?;
        tx.commit().map_err(map_sqlite_error)?;
        debug!(ops = batch.ops().len(), "Committed storage batch");
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        plan: &mut dyn FnMut(Option<&[u8]>) -> Option<WriteBatch>,
    ) -> StorageResult<()> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock before the read
        let tx = begin(&mut conn)?;
        let current = value_in(&tx, key)?;

        let Some(batch) = plan(current.as_deref()) else {
            return Ok(());
        };
        self.apply(&tx, &batch)?;
        tx.commit().map_err(map_sqlite_error)?;
        debug!(key, ops = batch.ops().len(), "Committed storage update");
        Ok(())
    }

    fn used_bytes(&self) -> StorageResult<u64> {
        let conn = self.lock()?;
        used_bytes_in(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_and_persistence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.db");

        {
            let store = SqliteBackend::open(&path).unwrap();
            store
                .write(
                    WriteBatch::new()
                        .put("record/1", b"one".to_vec())
                        .put("payload/1", vec![7; 64]),
                )
                .unwrap();
        }

        // Reopen: data survives a restart
        let store = SqliteBackend::open(&path).unwrap();
        assert_eq!(store.get("record/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.scan_prefix("payload/").unwrap().len(), 1);
    }

    #[test]
    fn test_quota_rejects_whole_batch() {
        let store = SqliteBackend::open_in_memory().unwrap().with_quota(100);

        let result = store.write(
            WriteBatch::new()
                .put("record/1", b"small".to_vec())
                .put("payload/1", vec![0; 500]),
        );

        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));
        assert!(store.get("record/1").unwrap().is_none());
        assert_eq!(store.used_bytes().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.db");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let result = SqliteBackend::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_update_is_serialized_across_connections() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.db");
        let first = SqliteBackend::open(&path).unwrap();
        let second = SqliteBackend::open(&path).unwrap();
        first.write(WriteBatch::new().put("slot", b"free".to_vec())).unwrap();

        // Both connections try to claim the same slot; only one sees it free
        let mut claims = 0;
        for store in [&first, &second] {
            store
                .update("slot", &mut |current| {
                    if current == Some(&b"free"[..]) {
                        claims += 1;
                        Some(WriteBatch::new().put("slot", b"taken".to_vec()))
                    } else {
                        None
                    }
                })
                .unwrap();
        }

        assert_eq!(claims, 1);
        assert_eq!(second.get("slot").unwrap(), Some(b"taken".to_vec()));
    }

    #[test]
    fn test_delete_in_batch() {
        let store = SqliteBackend::open_in_memory().unwrap();
        store
            .write(WriteBatch::new().put("a", vec![1]).put("b", vec![2]))
            .unwrap();
        store.write(WriteBatch::new().delete("a")).unwrap();

        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.get("b").unwrap(), Some(vec![2]));
    }
}
