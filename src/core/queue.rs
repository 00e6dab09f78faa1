//! Durable local submission queue.
//!
//! Records live under `record/<id>` as JSON and their payloads under
//! `payload/<id>`. A record and its payload are always written in the same
//! batch, so a crash never leaves one without the other. The queue is the
//! single writer of record state; every transition goes through
//! [`SubmissionQueue::update_state`] and is checked against
//! [`RecordState::can_transition_to`]. Each check runs in the same storage
//! transaction as its write, so two queues sharing one store cannot both
//! claim a record.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::transfer::ProgressSink;
use crate::domain::{RecordPatch, RecordState, SessionInfo, SubmissionRecord};
use crate::storage::{StorageBackend, StorageError, WriteBatch};

const RECORD_PREFIX: &str = "record/";

/// Default cap on one payload, whatever tier it is later sent on
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// Errors that can occur with the submission queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state transition for {id}: {from} → {to}")]
    InvalidTransition {
        id: String,
        from: RecordState,
        to: RecordState,
    },

    #[error("Record is being uploaded: {0}")]
    Busy(String),
}

/// Counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub uploading: usize,
    pub paused: usize,
    pub failed: usize,
    pub needs_attention: usize,
    pub completed: usize,
    /// Payload bytes not yet delivered
    pub pending_bytes: u64,
}

impl QueueStatus {
    pub fn pending(&self) -> usize {
        self.queued + self.uploading + self.paused + self.failed
    }
}

pub struct SubmissionQueue {
    backend: Arc<dyn StorageBackend>,
    max_payload_bytes: Option<u64>,
    clock: Arc<dyn Clock>,
}

fn record_key(id: &str) -> String {
    format!("{}{}", RECORD_PREFIX, id)
}

fn encode(record: &SubmissionRecord) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(record)
        .map_err(|e| StorageError::Corrupt(format!("cannot encode record {}: {}", record.id, e)).into())
}

fn decode(key: &str, raw: &[u8]) -> Result<SubmissionRecord, QueueError> {
    serde_json::from_slice(raw)
        .map_err(|e| StorageError::Corrupt(format!("cannot decode {}: {}", key, e)).into())
}

impl SubmissionQueue {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            max_payload_bytes: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Reject payloads above `limit` at enqueue time
    pub fn with_max_payload_bytes(mut self, limit: u64) -> Self {
        self.max_payload_bytes = Some(limit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Read-modify-write of one record in a single storage transaction.
    /// `change` returns the batch to commit (empty for none) and the result.
    fn modify<T>(
        &self,
        id: &str,
        change: impl FnOnce(SubmissionRecord) -> Result<(WriteBatch, T), QueueError>,
    ) -> Result<T, QueueError> {
        let key = record_key(id);
        let mut change = Some(change);
        let mut outcome = None;

        self.backend.update(&key, &mut |current| {
            let change = change.take()?;
            let result = match current {
                Some(raw) => decode(&key, raw).and_then(change),
                None => Err(QueueError::NotFound(id.to_string())),
            };
            match result {
                Ok((batch, value)) => {
                    outcome = Some(Ok(value));
                    (!batch.is_empty()).then_some(batch)
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    None
                }
            }
        })?;

        outcome.unwrap_or_else(|| Err(QueueError::NotFound(id.to_string())))
    }

    fn transition(
        &self,
        mut record: SubmissionRecord,
        to: RecordState,
        patch: RecordPatch,
    ) -> Result<(WriteBatch, SubmissionRecord), QueueError> {
        if !record.state.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: record.id,
                from: record.state,
                to,
            });
        }

        let now = self.clock.epoch_ms();
        patch.apply(&mut record);
        record.state = to;
        record.updated_at = now;

        let mut batch = WriteBatch::new();
        if to == RecordState::Completed {
            record.completed_at = Some(now);
            record.session = None;
            batch = batch.delete(record.payload_ref.clone());
        }
        batch = batch.put(record_key(&record.id), encode(&record)?);
        Ok((batch, record))
    }

    /// Persist a new record together with its payload
    pub fn enqueue(&self, mut record: SubmissionRecord, payload: &[u8]) -> Result<SubmissionRecord, QueueError> {
        let len = payload.len() as u64;
        if let Some(limit) = self.max_payload_bytes {
            if len > limit {
                warn!(id = %record.id, len, limit, "Payload exceeds local size limit");
                return Err(StorageError::QuotaExceeded {
                    needed: len,
                    available: limit,
                }
                .into());
            }
        }

        record.payload_len = len;
        record.state = RecordState::Queued;
        let batch = WriteBatch::new()
            .put(record_key(&record.id), encode(&record)?)
            .put(record.payload_ref.clone(), payload.to_vec());

        let mut batch = Some(batch);
        let mut exists = false;
        self.backend.update(&record_key(&record.id), &mut |current| {
            exists = current.is_some();
            if exists {
                None
            } else {
                batch.take()
            }
        })?;
        if exists {
            return Err(QueueError::AlreadyExists(record.id));
        }

        info!(id = %record.id, len, "Submission queued");
        Ok(record)
    }

    /// Create and enqueue a record for `payload`
    pub fn submit(
        &self,
        payload: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Result<SubmissionRecord, QueueError> {
        let mut record = SubmissionRecord::new(payload.len() as u64, metadata);
        let now = self.clock.epoch_ms();
        record.created_at = now;
        record.updated_at = now;
        self.enqueue(record, payload)
    }

    pub fn get(&self, id: &str) -> Result<Option<SubmissionRecord>, QueueError> {
        let key = record_key(id);
        match self.backend.get(&key)? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// All records, oldest first
    pub fn list(&self) -> Result<Vec<SubmissionRecord>, QueueError> {
        let mut records = self
            .backend
            .scan_prefix(RECORD_PREFIX)?
            .iter()
            .map(|(key, raw)| decode(key, raw))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Records eligible at `now`, in dequeue order
    pub fn eligible(&self, now: i64) -> Result<Vec<SubmissionRecord>, QueueError> {
        let mut records: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| r.is_eligible(now))
            .collect();
        records.sort_by_key(|r| (r.state.priority(), r.created_at));
        Ok(records)
    }

    /// Next record to attempt: queued before paused before retryable failed,
    /// oldest first within a state. Does not claim it.
    pub fn dequeue_next(&self, now: i64) -> Result<Option<SubmissionRecord>, QueueError> {
        Ok(self.eligible(now)?.into_iter().next())
    }

    /// Move `id` to `to`, applying `patch` in the same write
    pub fn update_state(
        &self,
        id: &str,
        to: RecordState,
        patch: RecordPatch,
    ) -> Result<SubmissionRecord, QueueError> {
        let record = self.modify(id, |record| self.transition(record, to, patch))?;
        debug!(id, %to, "Record state changed");
        Ok(record)
    }

    /// Persist upload progress without changing state
    pub fn save_session(&self, id: &str, session: &SessionInfo) -> Result<(), QueueError> {
        self.modify(id, |mut record| {
            if record.state == RecordState::Completed {
                return Ok((WriteBatch::new(), ()));
            }
            record.session = Some(session.clone());
            record.updated_at = self.clock.epoch_ms();
            Ok((WriteBatch::new().put(record_key(id), encode(&record)?), ()))
        })
    }

    pub fn load_payload(&self, record: &SubmissionRecord) -> Result<Vec<u8>, QueueError> {
        self.backend
            .get(&record.payload_ref)?
            .ok_or_else(|| {
                StorageError::Corrupt(format!("payload missing for record {}", record.id)).into()
            })
    }

    /// Delete a record and its payload. A record mid-upload belongs to the
    /// process transferring it and is refused.
    pub fn remove(&self, id: &str) -> Result<SubmissionRecord, QueueError> {
        let record = self.modify(id, |record| {
            if record.state == RecordState::Uploading {
                return Err(QueueError::Busy(record.id));
            }
            let batch = WriteBatch::new()
                .delete(record_key(id))
                .delete(record.payload_ref.clone());
            Ok((batch, record))
        })?;
        info!(id, state = %record.state, "Record removed");
        Ok(record)
    }

    /// Manual retry: back to `Queued` with a fresh attempt budget
    pub fn requeue(&self, id: &str) -> Result<SubmissionRecord, QueueError> {
        let patch = RecordPatch {
            attempt_count: Some(0),
            next_attempt_at: Some(0),
            retryable: Some(true),
            last_error: Some(None),
            ..Default::default()
        };
        let record = self.modify(id, |record| {
            if record.state == RecordState::Uploading {
                return Err(QueueError::Busy(record.id));
            }
            self.transition(record, RecordState::Queued, patch)
        })?;
        info!(id, "Record requeued");
        Ok(record)
    }

    /// After a restart, nothing is actually uploading; park those records.
    /// Only the process holding the queue lock may call this.
    pub fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let interrupted: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| r.state == RecordState::Uploading)
            .collect();

        for record in &interrupted {
            self.update_state(&record.id, RecordState::Paused, RecordPatch::default())?;
        }
        if !interrupted.is_empty() {
            info!(count = interrupted.len(), "Recovered interrupted uploads");
        }
        Ok(interrupted.len())
    }

    /// Delete completed records finalized at or before `cutoff` (epoch ms)
    pub fn purge_completed(&self, cutoff: i64) -> Result<usize, QueueError> {
        let stale: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| r.state == RecordState::Completed)
            .filter(|r| r.completed_at.unwrap_or(r.updated_at) <= cutoff)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }
        let batch = stale.iter().fold(WriteBatch::new(), |batch, r| {
            batch.delete(record_key(&r.id)).delete(r.payload_ref.clone())
        });
        self.backend.write(batch)?;

        info!(count = stale.len(), "Purged completed records");
        Ok(stale.len())
    }

    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut status = QueueStatus::default();
        for record in self.list()? {
            match record.state {
                RecordState::Queued => status.queued += 1,
                RecordState::Uploading => status.uploading += 1,
                RecordState::Paused => status.paused += 1,
                RecordState::Failed => {
                    status.failed += 1;
                    if record.needs_attention() {
                        status.needs_attention += 1;
                    }
                }
                RecordState::Completed => status.completed += 1,
            }
            if record.state != RecordState::Completed {
                status.pending_bytes += record.payload_len;
            }
        }
        Ok(status)
    }
}

impl ProgressSink for SubmissionQueue {
    fn record_progress(&self, id: &str, session: &SessionInfo) -> Result<(), StorageError> {
        self.save_session(id, session).map_err(|e| match e {
            QueueError::Storage(e) => e,
            other => StorageError::Unavailable(other.to_string()),
        })
    }
}
