//! Submission records and their lifecycle.
//!
//! A record is the durable local representation of one captured submission.
//! It is owned by the local queue until it reaches `Completed`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time as epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A pending or completed submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Client-generated, globally unique id
    pub id: String,

    /// Key of the payload blob in local storage
    pub payload_ref: String,

    /// Payload length in bytes
    pub payload_len: u64,

    /// Free-form submission metadata (title, language, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Current lifecycle state
    pub state: RecordState,

    /// Number of failed transfer attempts
    #[serde(default)]
    pub attempt_count: u32,

    /// Creation time (epoch ms)
    pub created_at: i64,

    /// Last state change (epoch ms)
    pub updated_at: i64,

    /// Backoff gate: not eligible for dequeue before this time (epoch ms)
    #[serde(default)]
    pub next_attempt_at: i64,

    /// Whether a `Failed` record is picked up again automatically
    #[serde(default = "default_retryable")]
    pub retryable: bool,

    /// Upload session this record is resuming, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,

    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Server artifact id, once finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,

    /// When the record reached `Completed` (epoch ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

fn default_retryable() -> bool {
    true
}

impl SubmissionRecord {
    /// Create a new queued record with a fresh id
    pub fn new(payload_len: u64, metadata: BTreeMap<String, String>) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        Self {
            payload_ref: format!("payload/{}", id),
            id,
            payload_len,
            metadata,
            state: RecordState::Queued,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: 0,
            retryable: true,
            session: None,
            last_error: None,
            artifact_id: None,
            completed_at: None,
        }
    }

    /// Whether the record may be picked up at `now`
    pub fn is_eligible(&self, now: i64) -> bool {
        if self.next_attempt_at > now {
            return false;
        }
        match self.state {
            RecordState::Queued | RecordState::Paused => true,
            RecordState::Failed => self.retryable,
            RecordState::Uploading | RecordState::Completed => false,
        }
    }

    /// Whether the user needs to act on this record
    pub fn needs_attention(&self) -> bool {
        self.state == RecordState::Failed && !self.retryable
    }
}

/// Lifecycle state of a submission record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Queued,
    Uploading,
    Paused,
    Failed,
    Completed,
}

impl RecordState {
    /// Whether `self → to` is a legal transition
    pub fn can_transition_to(self, to: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, to),
            (Queued, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Paused)
                | (Uploading, Queued)
                | (Paused, Uploading)
                | (Paused, Queued)
                | (Failed, Uploading)
                | (Failed, Queued)
        )
    }

    /// Dequeue priority (lower is preferred)
    pub fn priority(self) -> u8 {
        match self {
            RecordState::Queued => 0,
            RecordState::Paused => 1,
            RecordState::Failed => 2,
            RecordState::Uploading | RecordState::Completed => u8::MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Queued => "queued",
            RecordState::Uploading => "uploading",
            RecordState::Paused => "paused",
            RecordState::Failed => "failed",
            RecordState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side view of a server upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Server-issued session location (URL)
    pub location: String,

    /// Last server-acknowledged byte offset
    pub offset: u64,

    /// Session expiry (epoch ms), if the server announced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl SessionInfo {
    pub fn new(location: String, expires_at: Option<i64>) -> Self {
        Self {
            location,
            offset: 0,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Session id: last path segment of the location
    pub fn session_id(&self) -> &str {
        crate::protocol::session_id_from_location(&self.location)
    }

    /// Move the acknowledged offset forward; never backwards, never past `len`
    pub fn advance(&mut self, acknowledged: u64, len: u64) -> bool {
        if acknowledged < self.offset || acknowledged > len {
            return false;
        }
        self.offset = acknowledged;
        true
    }
}

/// Partial update applied together with a state change
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub attempt_count: Option<u32>,
    pub next_attempt_at: Option<i64>,
    pub retryable: Option<bool>,
    /// `Some(None)` clears the session
    pub session: Option<Option<SessionInfo>>,
    /// `Some(None)` clears the error
    pub last_error: Option<Option<String>>,
    pub artifact_id: Option<String>,
}

impl RecordPatch {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn apply(self, record: &mut SubmissionRecord) {
        if let Some(attempts) = self.attempt_count {
            record.attempt_count = attempts;
        }
        if let Some(at) = self.next_attempt_at {
            record.next_attempt_at = at;
        }
        if let Some(retryable) = self.retryable {
            record.retryable = retryable;
        }
        if let Some(session) = self.session {
            record.session = session;
        }
        if let Some(error) = self.last_error {
            record.last_error = error;
        }
        if let Some(artifact_id) = self.artifact_id {
            record.artifact_id = Some(artifact_id);
        }
    }
}
