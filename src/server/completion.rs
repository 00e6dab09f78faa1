//! Idempotent completion handshake.
//!
//! The client posts `{session_id, metadata}` once the last byte is
//! acknowledged. Finalization runs under the session's in-process lock and
//! its file lock, and checks the finalized index before doing any work, so
//! duplicate and concurrent notifications for one session produce exactly
//! one artifact.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use super::artifacts::{artifact_id_for, ArtifactStore};
use super::uploads::{is_valid_id, UploadError, UploadSessions};
use super::ServerSettings;
use crate::core::clock::Clock;
use crate::core::security::{payload_hash, RequestVerifier, SecurityError, SecurityHeaders};
use crate::domain::{Artifact, CompletionNotification, CompletionResult, CompletionStatus};
use crate::protocol::META_RECORD_ID;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Bad completion request: {0}")]
    BadRequest(String),

    #[error("Unknown upload session: {0}")]
    UnknownSession(String),

    #[error("Upload incomplete: {offset} of {length} bytes received")]
    Incomplete { offset: u64, length: u64 },

    #[error("Storage error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CompletionError {
    fn from(e: std::io::Error) -> Self {
        CompletionError::Io(e.to_string())
    }
}

impl From<UploadError> for CompletionError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Security(e) => CompletionError::Security(e),
            UploadError::NotFound(id) => CompletionError::UnknownSession(id),
            other => CompletionError::Io(other.to_string()),
        }
    }
}

impl CompletionError {
    /// HTTP status code for this error
    pub fn status(&self) -> u16 {
        match self {
            CompletionError::Security(SecurityError::BadSecret) => 403,
            CompletionError::Security(_) => 401,
            CompletionError::BadRequest(_) => 400,
            CompletionError::UnknownSession(_) => 404,
            CompletionError::Incomplete { .. } => 422,
            CompletionError::Io(_) => 500,
        }
    }
}

pub struct CompletionHandler {
    uploads: Arc<UploadSessions>,
    artifacts: Arc<ArtifactStore>,
    verifier: RequestVerifier,
    clock: Arc<dyn Clock>,
}

impl CompletionHandler {
    pub fn new(
        uploads: Arc<UploadSessions>,
        artifacts: Arc<ArtifactStore>,
        settings: &ServerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, UploadError> {
        let verifier = RequestVerifier::new(settings.shared_secret.clone(), settings.max_skew_secs)?;
        Ok(Self {
            uploads,
            artifacts,
            verifier,
            clock,
        })
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Handle one completion notification
    pub async fn receive(
        &self,
        headers: &SecurityHeaders,
        body: &[u8],
    ) -> Result<CompletionResult, CompletionError> {
        self.verifier
            .verify(headers, body, self.clock.epoch_ms() / 1000)
            .map_err(|e| {
                warn!(error = %e, "Rejected completion request");
                CompletionError::Security(e)
            })?;

        let notification: CompletionNotification = serde_json::from_slice(body)
            .map_err(|e| CompletionError::BadRequest(e.to_string()))?;
        let session_id = notification.session_id.clone();
        if session_id.trim().is_empty() {
            return Err(CompletionError::BadRequest("empty session_id".to_string()));
        }
        // Session ids name lock and index files; anything else never existed
        if !is_valid_id(&session_id) {
            warn!(session_id = %session_id, "Completion for malformed session id");
            return Err(CompletionError::UnknownSession(session_id));
        }

        let _guard = self.uploads.lock(&session_id).await;
        let _file_lock = self.artifacts.lock_session(&session_id).await?;

        if let Some(existing) = self.artifacts.find_by_session(&session_id).await? {
            info!(
                session_id = %session_id,
                artifact_id = %existing.artifact_id,
                "Duplicate completion, returning existing artifact"
            );
            return Ok(CompletionResult {
                artifact_id: existing.artifact_id,
                status: CompletionStatus::AlreadyFinalized,
            });
        }

        let session = self.uploads.session(&session_id).await?;
        if !session.is_complete() {
            return Err(CompletionError::Incomplete {
                offset: session.offset,
                length: session.length,
            });
        }

        let artifact_id = artifact_id_for(&session_id);
        let staged = self.uploads.staged_path(&session_id);
        // A previous attempt may have moved the payload before crashing
        let source = if tokio::fs::try_exists(&staged).await? {
            staged.clone()
        } else {
            self.artifacts.payload_path(&artifact_id)
        };
        let bytes = tokio::fs::read(&source).await?;

        let mut metadata = session.metadata.clone();
        metadata.extend(notification.metadata);
        let record_id = metadata.get(META_RECORD_ID).cloned();

        let artifact = Artifact {
            artifact_id: artifact_id.clone(),
            session_id: session_id.clone(),
            record_id,
            size_bytes: bytes.len() as u64,
            payload_hash: payload_hash(&bytes),
            metadata,
            created_at: Utc::now(),
        };

        self.artifacts.commit(&staged, &artifact).await?;
        self.uploads.mark_finalized(&session_id).await?;

        Ok(CompletionResult {
            artifact_id,
            status: CompletionStatus::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::protocol::create_signing_bytes;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const SECRET: &str = "s";

    struct Fixture {
        uploads: Arc<UploadSessions>,
        handler: CompletionHandler,
        clock: Arc<ManualClock>,
        temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new());
        let settings = ServerSettings {
            shared_secret: SECRET.to_string(),
            ..Default::default()
        };
        let uploads = Arc::new(
            UploadSessions::open(temp.path().join("staging"), &settings, clock.clone())
                .await
                .unwrap(),
        );
        let artifacts = Arc::new(ArtifactStore::open(temp.path().join("store")).await.unwrap());
        let handler =
            CompletionHandler::new(uploads.clone(), artifacts, &settings, clock.clone()).unwrap();
        Fixture {
            uploads,
            handler,
            clock,
            temp,
        }
    }

    fn sign(f: &Fixture, body: &[u8]) -> SecurityHeaders {
        SecurityHeaders::sign(SECRET, body, f.clock.epoch_ms() / 1000).unwrap()
    }

    async fn uploaded(f: &Fixture, data: &[u8]) -> String {
        let create = create_signing_bytes(data.len() as u64, "");
        let session = f
            .uploads
            .create(&sign(f, &create), data.len() as u64, "")
            .await
            .unwrap();
        f.uploads
            .append(&sign(f, data), &session.id, 0, data)
            .await
            .unwrap();
        session.id
    }

    fn notification(session_id: &str) -> Vec<u8> {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_RECORD_ID.to_string(), "rec-9".to_string());
        serde_json::to_vec(&CompletionNotification {
            session_id: session_id.to_string(),
            metadata,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_completion_returns_same_artifact() {
        let f = fixture().await;
        let session_id = uploaded(&f, b"hello").await;
        let body = notification(&session_id);

        let first = f.handler.receive(&sign(&f, &body), &body).await.unwrap();
        assert_eq!(first.status, CompletionStatus::Created);

        let second = f.handler.receive(&sign(&f, &body), &body).await.unwrap();
        assert_eq!(second.status, CompletionStatus::AlreadyFinalized);
        assert_eq!(second.artifact_id, first.artifact_id);

        let stored = f.handler.artifacts().list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record_id.as_deref(), Some("rec-9"));
        assert_eq!(stored[0].payload_hash, payload_hash(b"hello"));
    }

    #[tokio::test]
    async fn test_incomplete_upload_rejected() {
        let f = fixture().await;
        let create = create_signing_bytes(10, "");
        let session = f.uploads.create(&sign(&f, &create), 10, "").await.unwrap();
        let body = notification(&session.id);

        let err = f.handler.receive(&sign(&f, &body), &body).await.unwrap_err();
        assert_eq!(err.status(), 422);
    }

    #[tokio::test]
    async fn test_unknown_session_and_bad_secret() {
        let f = fixture().await;
        let body = notification("nosuchsession");

        let err = f.handler.receive(&sign(&f, &body), &body).await.unwrap_err();
        assert_eq!(err.status(), 404);

        let wrong = SecurityHeaders::sign("other", &body, f.clock.epoch_ms() / 1000).unwrap();
        let err = f.handler.receive(&wrong, &body).await.unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[tokio::test]
    async fn test_traversing_session_id_is_unknown_and_touches_nothing() {
        let f = fixture().await;
        let name = format!("escaped-{}", uuid::Uuid::new_v4().simple());
        let body = notification(&format!("../../../{}", name));

        let err = f.handler.receive(&sign(&f, &body), &body).await.unwrap_err();
        assert_eq!(err.status(), 404);

        let outside = f.temp.path().parent().unwrap().join(format!("{}.lock", name));
        assert!(!outside.exists());
        let locks = std::fs::read_dir(f.temp.path().join("store").join("locks")).unwrap();
        assert_eq!(locks.count(), 0);
    }
}
