//! Server side of the resumable upload protocol.
//!
//! The server components are transport-agnostic: they take parsed security
//! headers and raw bodies and return status-coded errors. `RelayServer`
//! bundles them over one data directory.

pub mod artifacts;
pub mod completion;
pub mod uploads;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::adapters::LoopbackTransport;
use crate::core::clock::{Clock, SystemClock};
use crate::core::security::DEFAULT_MAX_SKEW_SECS;

pub use artifacts::ArtifactStore;
pub use completion::{CompletionError, CompletionHandler};
pub use uploads::{UploadError, UploadSession, UploadSessions};

/// Server tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Shared secret every request must carry
    #[serde(default)]
    pub shared_secret: String,

    /// Lifetime of an upload session
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Largest accepted `Upload-Length`
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Tolerated clock skew of request timestamps
    #[serde(default = "default_max_skew_secs")]
    pub max_skew_secs: i64,
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_max_skew_secs() -> i64 {
    DEFAULT_MAX_SKEW_SECS
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            session_ttl_secs: default_session_ttl_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            max_skew_secs: default_max_skew_secs(),
        }
    }
}

/// One async mutex per session id, shared by appends and completion
#[derive(Default)]
pub(crate) struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub(crate) async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody is holding or waiting on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Upload sessions, artifact store and completion handler over one directory
pub struct RelayServer {
    root: PathBuf,
    uploads: Arc<UploadSessions>,
    completion: Arc<CompletionHandler>,
}

impl RelayServer {
    pub async fn open(root: impl AsRef<Path>, settings: ServerSettings) -> Result<Self, UploadError> {
        Self::open_with_clock(root, settings, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        root: impl AsRef<Path>,
        settings: ServerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, UploadError> {
        let root = root.as_ref().to_path_buf();
        let uploads = Arc::new(
            UploadSessions::open(root.join("staging"), &settings, clock.clone()).await?,
        );
        let artifacts = Arc::new(
            ArtifactStore::open(root.join("store"))
                .await
                .map_err(|e| UploadError::Io(e.to_string()))?,
        );
        let completion = Arc::new(CompletionHandler::new(
            uploads.clone(),
            artifacts,
            &settings,
            clock,
        )?);

        Ok(Self {
            root,
            uploads,
            completion,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads(&self) -> &Arc<UploadSessions> {
        &self.uploads
    }

    pub fn completion(&self) -> &Arc<CompletionHandler> {
        &self.completion
    }

    /// In-process transport talking to this server
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport::new(self.uploads.clone(), self.completion.clone())
    }
}
