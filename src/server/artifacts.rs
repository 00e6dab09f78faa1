//! Permanent artifact storage.
//!
//! ```text
//! store/
//!   artifacts/<artifact_id>.bin    payload
//!   artifacts/<artifact_id>.json   artifact record
//!   finalized/<session_id>.json    session -> artifact index (written last)
//!   locks/<session_id>.lock        cross-process completion lock
//! ```

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use super::uploads::{is_valid_id, write_atomic};
use crate::domain::Artifact;

/// Deterministic artifact id for a session
pub fn artifact_id_for(session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"artifact:");
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Exclusive file lock on one session, released on drop
#[derive(Debug)]
pub struct SessionFileLock {
    file: std::fs::File,
}

impl Drop for SessionFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        for sub in ["artifacts", "finalized", "locks"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join("artifacts").join(format!("{}.bin", artifact_id))
    }

    fn record_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join("artifacts").join(format!("{}.json", artifact_id))
    }

    fn index_path(&self, session_id: &str) -> PathBuf {
        self.root.join("finalized").join(format!("{}.json", session_id))
    }

    /// Block until this process holds the session's file lock
    pub async fn lock_session(&self, session_id: &str) -> io::Result<SessionFileLock> {
        check_session_id(session_id)?;
        let path = self.root.join("locks").join(format!("{}.lock", session_id));
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(SessionFileLock { file })
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    /// Artifact previously finalized from `session_id`
    pub async fn find_by_session(&self, session_id: &str) -> io::Result<Option<Artifact>> {
        check_session_id(session_id)?;
        read_json(&self.index_path(session_id)).await
    }

    pub async fn get(&self, artifact_id: &str) -> io::Result<Option<Artifact>> {
        read_json(&self.record_path(artifact_id)).await
    }

    /// Move the staged payload into place and publish the artifact.
    ///
    /// The session index is written last; until it exists the session
    /// counts as not finalized and the commit can be repeated.
    pub async fn commit(&self, staged: &Path, artifact: &Artifact) -> io::Result<()> {
        let target = self.payload_path(&artifact.artifact_id);
        if fs::try_exists(staged).await? {
            fs::rename(staged, &target).await?;
        } else if !fs::try_exists(&target).await? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("staged payload missing: {}", staged.display()),
            ));
        }

        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.record_path(&artifact.artifact_id), &json).await?;
        write_atomic(&self.index_path(&artifact.session_id), &json).await?;

        info!(
            artifact_id = %artifact.artifact_id,
            session_id = %artifact.session_id,
            size_bytes = artifact.size_bytes,
            "Artifact committed"
        );
        Ok(())
    }

    /// All committed artifacts
    pub async fn list(&self) -> io::Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        let mut entries = fs::read_dir(self.root.join("finalized")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(artifact) = read_json::<Artifact>(&path).await? {
                artifacts.push(artifact);
            }
        }

        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!(count = artifacts.len(), "Listed artifacts");
        Ok(artifacts)
    }
}

fn check_session_id(session_id: &str) -> io::Result<()> {
    if is_valid_id(session_id) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid session id: {:?}", session_id),
        ))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn artifact(session_id: &str) -> Artifact {
        Artifact {
            artifact_id: artifact_id_for(session_id),
            session_id: session_id.to_string(),
            record_id: Some("rec-1".to_string()),
            size_bytes: 3,
            payload_hash: "abc".to_string(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_artifact_id_is_deterministic() {
        assert_eq!(artifact_id_for("s1"), artifact_id_for("s1"));
        assert_ne!(artifact_id_for("s1"), artifact_id_for("s2"));
        assert_eq!(artifact_id_for("s1").len(), 16);
    }

    #[tokio::test]
    async fn test_commit_then_find() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("store")).await.unwrap();
        let staged = temp.path().join("s1.bin");
        fs::write(&staged, b"abc").await.unwrap();

        assert!(store.find_by_session("s1").await.unwrap().is_none());

        let art = artifact("s1");
        store.commit(&staged, &art).await.unwrap();

        assert_eq!(store.find_by_session("s1").await.unwrap(), Some(art.clone()));
        assert_eq!(store.get(&art.artifact_id).await.unwrap(), Some(art.clone()));
        assert_eq!(fs::read(store.payload_path(&art.artifact_id)).await.unwrap(), b"abc");
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_commit_resumes_after_moved_payload() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("store")).await.unwrap();
        let art = artifact("s2");

        // Payload already moved, index never written
        fs::write(store.payload_path(&art.artifact_id), b"abc").await.unwrap();
        store
            .commit(&temp.path().join("missing.bin"), &art)
            .await
            .unwrap();

        assert!(store.find_by_session("s2").await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_paths_stay_inside_root() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("store")).await.unwrap();

        let err = store.lock_session("../outside").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = store.find_by_session("a/b").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!temp.path().join("store").join("outside.lock").exists());
    }
}
