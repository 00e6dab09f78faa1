//! In-memory backend with an optional byte quota.
//!
//! Models a restricted browser-style store: tests use it to exercise quota
//! and unavailable-storage paths without touching disk.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{projected_size, BatchOp, StorageBackend, StorageError, StorageResult, WriteBatch};

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    quota_bytes: Option<u64>,
    failure: Mutex<Option<StorageError>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects writes beyond `quota_bytes`
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Default::default()
        }
    }

    /// Make every subsequent call fail with `error` (`None` restores service)
    pub fn fail_with(&self, error: Option<StorageError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    fn check_failure(&self) -> StorageResult<()> {
        let failure = self
            .failure
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".to_string()))?;
        match failure.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".to_string()))
    }
}

impl MemoryBackend {
    fn apply(&self, entries: &mut BTreeMap<String, Vec<u8>>, batch: &WriteBatch) -> StorageResult<()> {
        if let Some(quota) = self.quota_bytes {
            let current: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
            let projected = projected_size(current, batch, |key| {
                Ok(entries.get(key).map(|value| entry_size(key, value)))
            })?;
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
                    entries.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_failure()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.check_failure()?;
        let entries = self.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        self.check_failure()?;
        let mut entries = self.lock()?;
        self.apply(&mut entries, &batch)
    }

    fn update(
        &self,
        key: &str,
        plan: &mut dyn FnMut(Option<&[u8]>) -> Option<WriteBatch>,
    ) -> StorageResult<()> {
        self.check_failure()?;
        let mut entries = self.lock()?;
        let planned = plan(entries.get(key).map(Vec::as_slice));
        match planned {
            Some(batch) => self.apply(&mut entries, &batch),
            None => Ok(()),
        }
    }

    fn used_bytes(&self) -> StorageResult<u64> {
        self.check_failure()?;
        Ok(self.lock()?.iter().map(|(k, v)| entry_size(k, v)).sum())
    }
}
