//! Canonical paths for capture-relay state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! | Location | Owner | Purpose |
//! |----------|-------|---------|
//! | `queue.db` | client | SQLite key-value store behind the submission queue |
//! | `queue.lock` | client | held by the one process uploading from the queue |
//! | `relay/staging/` | local relay | in-progress upload sessions |
//! | `relay/store/` | local relay | finalized artifacts and session index |

use std::path::{Path, PathBuf};

use anyhow::Result;

/// Get the capture-relay home directory (~/.capture-relay)
pub fn home() -> Result<PathBuf> {
    crate::config::relay_home()
}

/// Queue database under `home`
pub fn queue_db_in(home: &Path) -> PathBuf {
    home.join("queue.db")
}

/// Uploader lock under `home`
pub fn queue_lock_in(home: &Path) -> PathBuf {
    home.join("queue.lock")
}

/// Local relay directory under `home`
pub fn relay_dir_in(home: &Path) -> PathBuf {
    home.join("relay")
}

/// Get the queue database path (~/.capture-relay/queue.db)
pub fn queue_db() -> Result<PathBuf> {
    Ok(queue_db_in(&home()?))
}

/// Get the local relay directory (~/.capture-relay/relay/)
pub fn relay_dir() -> Result<PathBuf> {
    Ok(relay_dir_in(&home()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_home() {
        let home = PathBuf::from("/data/.capture-relay");
        assert_eq!(queue_db_in(&home), PathBuf::from("/data/.capture-relay/queue.db"));
        assert_eq!(relay_dir_in(&home), PathBuf::from("/data/.capture-relay/relay"));
        assert_eq!(queue_lock_in(&home), PathBuf::from("/data/.capture-relay/queue.lock"));
    }
}
