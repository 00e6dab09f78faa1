//! Transport adapters for the resumable upload protocol.
//!
//! The transfer client and the tier classifier only talk to the network
//! through [`UploadTransport`], so retry and backoff stay visible loops in
//! `core` instead of callbacks inside an HTTP library.

pub mod http;
pub mod loopback;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::security::SecurityHeaders;
use crate::domain::{CompletionResult, ErrorKind};

pub use http::HttpTransport;
pub use loopback::LoopbackTransport;

/// Errors that can occur while talking to the upload server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Upload session is gone: {0}")]
    SessionGone(String),

    #[error("Offset conflict: server is at {server_offset:?}")]
    OffsetMismatch { server_offset: Option<u64> },

    #[error("Request rejected ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// The server refused the request itself; resending it cannot succeed
    #[error("Server refused request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Session already finalized")]
    AlreadyFinalized,

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Classify an error status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => TransportError::Unauthorized { status, message },
            404 | 410 => TransportError::SessionGone(message),
            409 => TransportError::OffsetMismatch {
                server_offset: None,
            },
            400 | 413 | 422 => TransportError::Rejected { status, message },
            _ => TransportError::Status { status, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::SessionGone(_) => ErrorKind::SessionExpired,
            TransportError::Unauthorized { .. } => ErrorKind::SecurityRejected,
            TransportError::AlreadyFinalized => ErrorKind::HandshakeConflict,
            TransportError::Timeout(_)
            | TransportError::Network(_)
            | TransportError::Status { .. }
            | TransportError::Rejected { .. }
            | TransportError::OffsetMismatch { .. }
            | TransportError::Protocol(_) => ErrorKind::TransferFailed,
        }
    }

    /// Whether the failure says something about endpoint health
    pub fn counts_against_endpoint(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Create-stage request
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub endpoint: String,
    pub upload_length: u64,
    pub metadata: BTreeMap<String, String>,
    pub headers: SecurityHeaders,
    pub timeout: Duration,
}

/// Create-stage response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub location: String,
    pub expires_at: Option<i64>,
}

/// The four protocol stages plus the classifier probe
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Create: declare length and metadata, receive a session location
    async fn create(&self, request: CreateRequest) -> Result<CreatedSession, TransportError>;

    /// Probe: ask for the server-acknowledged offset
    async fn head_offset(
        &self,
        location: &str,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<u64, TransportError>;

    /// Transfer: send `body` starting at `offset`, receive the new offset
    async fn patch(
        &self,
        location: &str,
        offset: u64,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<u64, TransportError>;

    /// Completion: post the notification body to the webhook
    async fn complete(
        &self,
        webhook: &str,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<CompletionResult, TransportError>;

    /// Fetch the cache-busted probe resource, returning its size in bytes
    async fn probe(
        &self,
        url: &str,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}
