//! Resumable chunked transfer client.
//!
//! One `upload` call is one attempt: resume or create a session, send the
//! remaining bytes chunk by chunk, then run the completion handshake. A
//! failed chunk ends the attempt without moving the offset; the next attempt
//! asks the server where it stands before sending anything.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::breaker::{CircuitBreakers, Decision};
use super::clock::{Clock, SystemClock};
use super::error::SubmitError;
use super::security::{SecurityError, SecurityHeaders};
use crate::adapters::{CreateRequest, TransportError, UploadTransport};
use crate::domain::{CompletionNotification, CompletionStatus, SessionInfo, SubmissionRecord, TierSettings};
use crate::protocol::{create_signing_bytes, encode_metadata, META_RECORD_ID};
use crate::storage::StorageError;

/// How many offset conflicts one attempt tolerates before giving up
const MAX_OFFSET_RESYNCS: u32 = 3;

/// Where the transfer client persists acknowledged progress
pub trait ProgressSink: Send + Sync {
    fn record_progress(&self, id: &str, session: &SessionInfo) -> Result<(), StorageError>;
}

/// Result of a successful attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Absent when the server reported a prior finalization without its id
    pub artifact_id: Option<String>,
    pub status: CompletionStatus,
    /// Payload bytes sent during this attempt
    pub bytes_sent: u64,
}

pub struct TransferClient {
    transport: Arc<dyn UploadTransport>,
    breakers: Arc<CircuitBreakers>,
    endpoint: String,
    webhook: String,
    secret: String,
    clock: Arc<dyn Clock>,
}

impl TransferClient {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        breakers: Arc<CircuitBreakers>,
        endpoint: impl Into<String>,
        webhook: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            breakers,
            endpoint: endpoint.into(),
            webhook: webhook.into(),
            secret: secret.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn webhook(&self) -> &str {
        &self.webhook
    }

    fn sign(&self, body: &[u8]) -> Result<SecurityHeaders, SubmitError> {
        Ok(SecurityHeaders::sign(
            &self.secret,
            body,
            self.clock.epoch_ms() / 1000,
        )?)
    }

    /// Run `call` behind the breaker for `key`, bounded by `timeout` and
    /// `cancel`. The outer error means the call never produced a verdict.
    async fn guarded<T, F>(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Result<T, TransportError>, SubmitError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if let Decision::Deny { retry_after } = self.breakers.before_attempt(key) {
            debug!(endpoint = key, ?retry_after, "Circuit open, skipping request");
            return Err(SubmitError::BreakerOpen {
                endpoint: key.to_string(),
                retry_after,
            });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.breakers.release_trial(key);
                return Err(SubmitError::Cancelled);
            }
            r = tokio::time::timeout(timeout, call) => {
                r.unwrap_or_else(|_| Err(TransportError::Timeout(timeout)))
            }
        };

        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.counts_against_endpoint(),
        };
        self.breakers.record_result(key, healthy);
        Ok(result)
    }

    async fn head(
        &self,
        location: &str,
        tier: &TierSettings,
        cancel: &CancellationToken,
    ) -> Result<Result<u64, TransportError>, SubmitError> {
        let headers = self.sign(b"")?;
        let timeout = tier.timeout();
        self.guarded(
            &self.endpoint,
            timeout,
            cancel,
            self.transport.head_offset(location, &headers, timeout),
        )
        .await
    }

    async fn create_session(
        &self,
        record: &SubmissionRecord,
        tier: &TierSettings,
        cancel: &CancellationToken,
    ) -> Result<SessionInfo, SubmitError> {
        let mut metadata = record.metadata.clone();
        metadata.insert(META_RECORD_ID.to_string(), record.id.clone());
        let header = encode_metadata(&metadata);

        let request = CreateRequest {
            endpoint: self.endpoint.clone(),
            upload_length: record.payload_len,
            headers: self.sign(&create_signing_bytes(record.payload_len, &header))?,
            metadata,
            timeout: tier.timeout(),
        };

        let created = self
            .guarded(
                &self.endpoint,
                tier.timeout(),
                cancel,
                self.transport.create(request),
            )
            .await??;

        info!(id = %record.id, location = %created.location, "Upload session created");
        Ok(SessionInfo::new(created.location, created.expires_at))
    }

    /// Resume the record's session if the server still has it, otherwise
    /// start a new one
    async fn open_session(
        &self,
        record: &SubmissionRecord,
        tier: &TierSettings,
        cancel: &CancellationToken,
    ) -> Result<SessionInfo, SubmitError> {
        let now = self.clock.epoch_ms();
        let existing = record.session.clone().filter(|s| !s.is_expired(now));

        let Some(mut session) = existing else {
            return self.create_session(record, tier, cancel).await;
        };

        match self.head(&session.location, tier, cancel).await? {
            Ok(offset) if offset <= record.payload_len => {
                if offset != session.offset {
                    debug!(id = %record.id, local = session.offset, server = offset, "Resyncing offset");
                }
                // The server's offset is authoritative, even if it went backwards
                session.offset = offset;
                Ok(session)
            }
            Ok(offset) => {
                warn!(id = %record.id, offset, len = record.payload_len, "Session offset past payload, restarting");
                self.create_session(record, tier, cancel).await
            }
            Err(TransportError::SessionGone(_)) => {
                info!(id = %record.id, "Upload session gone, starting a new one");
                self.create_session(record, tier, cancel).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One upload attempt for `record`.
    ///
    /// Progress is persisted through `progress` after the session is known and
    /// after every acknowledged chunk.
    #[instrument(skip_all, fields(id = %record.id, len = payload.len()))]
    pub async fn upload(
        &self,
        record: &mut SubmissionRecord,
        payload: &[u8],
        tier: &TierSettings,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, SubmitError> {
        if self.secret.trim().is_empty() {
            warn!("No shared secret configured, refusing to upload");
            return Err(SecurityError::MissingSecret.into());
        }

        let len = payload.len() as u64;
        record.payload_len = len;

        let mut session = self.open_session(record, tier, cancel).await?;
        record.session = Some(session.clone());
        progress.record_progress(&record.id, &session)?;

        let chunk_size = tier.chunk_size_bytes.max(1) as usize;
        let mut bytes_sent = 0u64;
        let mut resyncs = 0u32;

        while session.offset < len {
            let start = session.offset as usize;
            let end = (start + chunk_size).min(payload.len());
            let headers = self.sign(&payload[start..end])?;
            let timeout = tier.timeout();

            let result = self
                .guarded(
                    &self.endpoint,
                    timeout,
                    cancel,
                    self.transport.patch(
                        &session.location,
                        session.offset,
                        payload[start..end].to_vec(),
                        &headers,
                        timeout,
                    ),
                )
                .await?;

            match result {
                Ok(ack) => {
                    if !session.advance(ack, len) {
                        return Err(SubmitError::Transfer(format!(
                            "server acknowledged offset {} outside {}..={}",
                            ack, session.offset, len
                        )));
                    }
                    bytes_sent += (end - start) as u64;
                    record.session = Some(session.clone());
                    progress.record_progress(&record.id, &session)?;
                    debug!(offset = session.offset, len, "Chunk acknowledged");
                }
                Err(TransportError::OffsetMismatch { server_offset }) => {
                    resyncs += 1;
                    if resyncs > MAX_OFFSET_RESYNCS {
                        return Err(SubmitError::Transfer(
                            "offset kept diverging from server".to_string(),
                        ));
                    }
                    let offset = match server_offset {
                        Some(offset) => offset,
                        None => self.head(&session.location, tier, cancel).await??,
                    };
                    if offset > len {
                        return Err(SubmitError::Transfer(format!(
                            "server offset {} past payload length {}",
                            offset, len
                        )));
                    }
                    debug!(local = session.offset, server = offset, "Offset conflict, resyncing");
                    session.offset = offset;
                    record.session = Some(session.clone());
                    progress.record_progress(&record.id, &session)?;
                }
                Err(e) => {
                    warn!(offset = session.offset, error = %e, "Chunk failed");
                    return Err(e.into());
                }
            }
        }

        let mut metadata: BTreeMap<String, String> = record.metadata.clone();
        metadata.insert(META_RECORD_ID.to_string(), record.id.clone());
        let notification = CompletionNotification {
            session_id: session.session_id().to_string(),
            metadata,
        };
        let body = serde_json::to_vec(&notification)
            .map_err(|e| SubmitError::Transfer(format!("cannot encode completion: {}", e)))?;
        let headers = self.sign(&body)?;
        let timeout = tier.timeout();

        let completed = self
            .guarded(
                &self.webhook,
                timeout,
                cancel,
                self.transport.complete(&self.webhook, body, &headers, timeout),
            )
            .await?;

        let outcome = match completed {
            Ok(result) => TransferOutcome {
                artifact_id: Some(result.artifact_id),
                status: result.status,
                bytes_sent,
            },
            Err(TransportError::AlreadyFinalized) => TransferOutcome {
                artifact_id: None,
                status: CompletionStatus::AlreadyFinalized,
                bytes_sent,
            },
            Err(e) => return Err(e.into()),
        };

        info!(
            artifact_id = outcome.artifact_id.as_deref().unwrap_or("-"),
            status = ?outcome.status,
            bytes_sent,
            "Submission delivered"
        );
        Ok(outcome)
    }
}
