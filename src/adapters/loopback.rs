//! In-process transport bound directly to the server components.
//!
//! Used for local relay mode and by tests. Every request goes
//! through the same verification, offset and completion logic a network
//! server would run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CreateRequest, CreatedSession, TransportError, UploadTransport};
use crate::core::security::SecurityHeaders;
use crate::domain::CompletionResult;
use crate::protocol::{encode_metadata, session_id_from_location, PROBE_BYTES};
use crate::server::{CompletionError, CompletionHandler, UploadError, UploadSessions};

/// Base URL of loopback session locations
pub const LOOPBACK_BASE: &str = "loopback://relay";

pub struct LoopbackTransport {
    sessions: Arc<UploadSessions>,
    completion: Arc<CompletionHandler>,
}

impl LoopbackTransport {
    pub fn new(sessions: Arc<UploadSessions>, completion: Arc<CompletionHandler>) -> Self {
        Self {
            sessions,
            completion,
        }
    }

    pub fn location_for(session_id: &str) -> String {
        format!("{}/uploads/{}", LOOPBACK_BASE, session_id)
    }
}

fn upload_error(e: UploadError) -> TransportError {
    let server_offset = e.server_offset();
    match TransportError::from_status(e.status(), e.to_string()) {
        TransportError::OffsetMismatch { .. } => TransportError::OffsetMismatch { server_offset },
        other => other,
    }
}

fn completion_error(e: CompletionError) -> TransportError {
    TransportError::from_status(e.status(), e.to_string())
}

#[async_trait]
impl UploadTransport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn create(&self, request: CreateRequest) -> Result<CreatedSession, TransportError> {
        let header = encode_metadata(&request.metadata);
        let session = self
            .sessions
            .create(&request.headers, request.upload_length, &header)
            .await
            .map_err(upload_error)?;

        Ok(CreatedSession {
            location: Self::location_for(&session.id),
            expires_at: Some(session.expires_at),
        })
    }

    async fn head_offset(
        &self,
        location: &str,
        headers: &SecurityHeaders,
        _timeout: Duration,
    ) -> Result<u64, TransportError> {
        self.sessions
            .offset(headers, session_id_from_location(location))
            .await
            .map_err(upload_error)
    }

    async fn patch(
        &self,
        location: &str,
        offset: u64,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        _timeout: Duration,
    ) -> Result<u64, TransportError> {
        self.sessions
            .append(headers, session_id_from_location(location), offset, &body)
            .await
            .map_err(upload_error)
    }

    async fn complete(
        &self,
        _webhook: &str,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        _timeout: Duration,
    ) -> Result<CompletionResult, TransportError> {
        self.completion
            .receive(headers, &body)
            .await
            .map_err(completion_error)
    }

    async fn probe(
        &self,
        _url: &str,
        headers: &SecurityHeaders,
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.sessions.verify(headers, b"").map_err(upload_error)?;
        Ok(PROBE_BYTES)
    }
}
