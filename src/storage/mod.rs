//! Key-value persistence behind the local queue.
//!
//! Backends return a tagged result: either success or one of three storage
//! error kinds. A backend must apply a [`WriteBatch`] atomically.

pub mod lock;
pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::domain::ErrorKind;

pub use lock::QueueLock;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Errors that can occur in a storage backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Local storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Local storage corrupt: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Unavailable(_) => ErrorKind::StorageUnavailable,
            StorageError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            StorageError::Corrupt(_) => ErrorKind::StorageCorrupt,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A single mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Mutations applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable key-value store
pub trait StorageBackend: Send + Sync {
    /// Read one value
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Apply a batch atomically
    fn write(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Read `key` and apply the batch `plan` builds from its current value,
    /// with no other writer in between (including other processes sharing
    /// the store). A `plan` returning `None` writes nothing.
    fn update(
        &self,
        key: &str,
        plan: &mut dyn FnMut(Option<&[u8]>) -> Option<WriteBatch>,
    ) -> StorageResult<()>;

    /// Bytes currently stored (keys and values)
    fn used_bytes(&self) -> StorageResult<u64>;
}

/// Size of the store after applying `batch` to a store where `size_of(key)`
/// reports the current entry size
pub(crate) fn projected_size<F>(current: u64, batch: &WriteBatch, mut size_of: F) -> StorageResult<u64>
where
    F: FnMut(&str) -> StorageResult<Option<u64>>,
{
    let mut projected = current as i128;
    let mut touched: std::collections::HashMap<&str, Option<u64>> = std::collections::HashMap::new();

    for op in batch.ops() {
        let key = match op {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key.as_str(),
        };
        let before = match touched.get(key) {
            Some(size) => *size,
            None => size_of(key)?,
        };
        if let Some(size) = before {
            projected -= size as i128;
        }
        let after = match op {
            BatchOp::Put { key, value } => Some((key.len() + value.len()) as u64),
            BatchOp::Delete { .. } => None,
        };
        if let Some(size) = after {
            projected += size as i128;
        }
        touched.insert(key, after);
    }

    Ok(projected.max(0) as u64)
}
