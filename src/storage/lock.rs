//! Advisory lock naming the one process allowed to upload from a queue.
//!
//! Holding it means no other process has records in `Uploading`, so the
//! holder may treat any it finds as interrupted.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use tracing::debug;

use super::{StorageError, StorageResult};

#[derive(Debug)]
pub struct QueueLock {
    file: File,
}

impl QueueLock {
    /// Take the lock at `path` without waiting. `Ok(None)` when another
    /// holder has it.
    pub fn try_acquire(path: &Path) -> StorageResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| unavailable(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Queue lock acquired");
                Ok(Some(Self { file }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(unavailable(path, e)),
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn unavailable(path: &Path, e: io::Error) -> StorageError {
    StorageError::Unavailable(format!("queue lock {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.lock");

        let first = QueueLock::try_acquire(&path).unwrap().unwrap();
        assert!(QueueLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        let again = QueueLock::try_acquire(&path).unwrap();
        assert!(again.is_some());
    }
}
