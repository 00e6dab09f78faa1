//! Upload session store.
//!
//! Each session is staged as two files in the staging directory:
//! `<id>.json` (session state) and `<id>.bin` (bytes received so far).
//! The state file is replaced atomically; the data file is truncated back
//! to the recorded offset before every append, so a crash between the two
//! writes never exposes unacknowledged bytes.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ServerSettings, SessionLocks};
use crate::core::clock::Clock;
use crate::core::security::{RequestVerifier, SecurityError, SecurityHeaders};
use crate::protocol::{create_signing_bytes, decode_metadata};

/// Errors returned to upload clients
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Upload session not found: {0}")]
    NotFound(String),

    #[error("Upload session expired: {0}")]
    Expired(String),

    #[error("Offset mismatch: session is at {expected}, request at {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("Upload too large: {length} bytes exceeds limit of {limit}")]
    TooLarge { length: u64, limit: u64 },

    #[error("Upload session already finalized: {0}")]
    Finalized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Io(String),
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}

impl UploadError {
    /// HTTP status code for this error
    pub fn status(&self) -> u16 {
        match self {
            UploadError::Security(SecurityError::BadSecret) => 403,
            UploadError::Security(_) => 401,
            UploadError::NotFound(_) => 404,
            UploadError::Expired(_) => 410,
            UploadError::OffsetMismatch { .. } | UploadError::Finalized(_) => 409,
            UploadError::TooLarge { .. } => 413,
            UploadError::BadRequest(_) => 400,
            UploadError::Io(_) => 500,
        }
    }

    /// Offset to report alongside a 409
    pub fn server_offset(&self) -> Option<u64> {
        match self {
            UploadError::OffsetMismatch { expected, .. } => Some(*expected),
            _ => None,
        }
    }
}

/// Persisted session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    /// Declared total length
    pub length: u64,
    /// Bytes durably received
    pub offset: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Epoch ms
    pub created_at: i64,
    /// Epoch ms
    pub expires_at: i64,
    #[serde(default)]
    pub finalized: bool,
}

impl UploadSession {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.length
    }
}

pub struct UploadSessions {
    dir: PathBuf,
    verifier: RequestVerifier,
    ttl: Duration,
    max_upload_bytes: u64,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
}

impl UploadSessions {
    pub async fn open(
        dir: impl Into<PathBuf>,
        settings: &ServerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, UploadError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let verifier = RequestVerifier::new(settings.shared_secret.clone(), settings.max_skew_secs)?;

        Ok(Self {
            dir,
            verifier,
            ttl: Duration::from_secs(settings.session_ttl_secs),
            max_upload_bytes: settings.max_upload_bytes,
            clock,
            locks: SessionLocks::default(),
        })
    }

    fn now_secs(&self) -> i64 {
        self.clock.epoch_ms() / 1000
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Path of the bytes received for `id`
    pub fn staged_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }

    pub(crate) async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(id).await
    }

    pub(crate) fn verify(&self, headers: &SecurityHeaders, body: &[u8]) -> Result<(), UploadError> {
        self.verifier
            .verify(headers, body, self.now_secs())
            .map_err(|e| {
                warn!(error = %e, "Rejected upload request");
                UploadError::Security(e)
            })
    }

    /// Create stage: open a new session for `upload_length` bytes
    pub async fn create(
        &self,
        headers: &SecurityHeaders,
        upload_length: u64,
        metadata_header: &str,
    ) -> Result<UploadSession, UploadError> {
        self.verify(headers, &create_signing_bytes(upload_length, metadata_header))?;

        if upload_length > self.max_upload_bytes {
            return Err(UploadError::TooLarge {
                length: upload_length,
                limit: self.max_upload_bytes,
            });
        }
        let metadata = decode_metadata(metadata_header).map_err(UploadError::BadRequest)?;

        let now = self.clock.epoch_ms();
        let session = UploadSession {
            id: Uuid::new_v4().simple().to_string(),
            length: upload_length,
            offset: 0,
            metadata,
            created_at: now,
            expires_at: now + self.ttl.as_millis() as i64,
            finalized: false,
        };

        fs::write(self.staged_path(&session.id), b"").await?;
        self.save(&session).await?;

        info!(session_id = %session.id, length = upload_length, "Upload session created");
        Ok(session)
    }

    /// Probe stage: the durable offset of `id`
    pub async fn offset(&self, headers: &SecurityHeaders, id: &str) -> Result<u64, UploadError> {
        self.verify(headers, b"")?;

        let session = self.session(id).await?;
        if !session.finalized && session.is_expired(self.clock.epoch_ms()) {
            return Err(UploadError::Expired(id.to_string()));
        }
        Ok(session.offset)
    }

    /// Transfer stage: append `body` at `offset`, returning the new offset
    pub async fn append(
        &self,
        headers: &SecurityHeaders,
        id: &str,
        offset: u64,
        body: &[u8],
    ) -> Result<u64, UploadError> {
        self.verify(headers, body)?;

        let _guard = self.lock(id).await;
        let mut session = self.session(id).await?;

        if session.finalized {
            return Err(UploadError::Finalized(id.to_string()));
        }
        if session.is_expired(self.clock.epoch_ms()) {
            return Err(UploadError::Expired(id.to_string()));
        }
        if offset != session.offset {
            debug!(session_id = id, expected = session.offset, got = offset, "Offset mismatch");
            return Err(UploadError::OffsetMismatch {
                expected: session.offset,
                got: offset,
            });
        }
        let end = offset + body.len() as u64;
        if end > session.length {
            return Err(UploadError::TooLarge {
                length: end,
                limit: session.length,
            });
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.staged_path(id))
            .await?;
        file.set_len(session.offset).await?;
        file.seek(SeekFrom::Start(session.offset)).await?;
        file.write_all(body).await?;
        file.sync_data().await?;

        session.offset = end;
        self.save(&session).await?;

        debug!(session_id = id, offset = end, length = session.length, "Chunk accepted");
        Ok(end)
    }

    /// Load session state without authentication (server-internal)
    pub async fn session(&self, id: &str) -> Result<UploadSession, UploadError> {
        if !is_valid_id(id) {
            return Err(UploadError::NotFound(id.to_string()));
        }
        let raw = match fs::read(self.meta_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| UploadError::Io(format!("corrupt session state {}: {}", id, e)))
    }

    /// Mark `id` finalized; the caller holds the session lock
    pub(crate) async fn mark_finalized(&self, id: &str) -> Result<(), UploadError> {
        let mut session = self.session(id).await?;
        session.finalized = true;
        self.save(&session).await
    }

    /// Delete sessions past their expiry, returning how many were removed
    pub async fn purge_expired(&self) -> Result<usize, UploadError> {
        let now = self.clock.epoch_ms();
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let _guard = self.lock(&id).await;
            let session = match self.session(&id).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping unreadable session");
                    continue;
                }
            };
            if !session.is_expired(now) {
                continue;
            }

            remove_if_exists(&self.staged_path(&id)).await?;
            remove_if_exists(&path).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Purged expired upload sessions");
        }
        Ok(removed)
    }

    async fn save(&self, session: &UploadSession) -> Result<(), UploadError> {
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| UploadError::Io(e.to_string()))?;
        write_atomic(&self.meta_path(&session.id), &json).await?;
        Ok(())
    }
}

/// Session ids are generated hex strings; reject anything path-like
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
