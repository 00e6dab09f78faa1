//! Errors surfaced by the submission pipeline.

use std::time::Duration;

use thiserror::Error;

use super::queue::QueueError;
use super::security::SecurityError;
use crate::adapters::TransportError;
use crate::domain::ErrorKind;
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Endpoint {endpoint} is unavailable; retry in {retry_after:?}")]
    BreakerOpen {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Permanent refusal; retrying the same upload cannot succeed
    #[error("Upload refused: {0}")]
    Rejected(String),

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Request rejected: {0}")]
    Security(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Record {0} already exists")]
    Duplicate(String),

    #[error("Record {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Record {0} is being uploaded by another process")]
    Busy(String),
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::Storage(e) => e.kind(),
            SubmitError::BreakerOpen { .. } => ErrorKind::BreakerOpen,
            SubmitError::SessionExpired(_) => ErrorKind::SessionExpired,
            SubmitError::Security(_) => ErrorKind::SecurityRejected,
            SubmitError::Transfer(_)
            | SubmitError::Rejected(_)
            | SubmitError::Busy(_)
            | SubmitError::Cancelled
            | SubmitError::NotFound(_)
            | SubmitError::Duplicate(_)
            | SubmitError::InvalidTransition { .. } => ErrorKind::TransferFailed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SubmitError::Cancelled | SubmitError::Rejected(_) | SubmitError::Busy(_)
        ) && self.kind().is_retryable()
    }

    /// Message suitable for showing to the person who recorded the audio
    pub fn user_message(&self) -> String {
        match self {
            SubmitError::Storage(StorageError::QuotaExceeded { .. }) => {
                "Not enough space on this device to keep the recording.".to_string()
            }
            SubmitError::Storage(_) => {
                "The recording could not be saved on this device.".to_string()
            }
            SubmitError::BreakerOpen { .. } | SubmitError::Transfer(_) => {
                "Saved on this device. It will upload when the connection improves.".to_string()
            }
            SubmitError::SessionExpired(_) => {
                "Saved on this device. The upload will restart automatically.".to_string()
            }
            SubmitError::Security(_) => {
                "The upload was refused. Check the relay's shared secret.".to_string()
            }
            SubmitError::Cancelled => "Upload cancelled.".to_string(),
            SubmitError::Rejected(_) => {
                "The relay refused this recording. It stays on this device.".to_string()
            }
            SubmitError::Busy(_)
            | SubmitError::NotFound(_)
            | SubmitError::Duplicate(_)
            | SubmitError::InvalidTransition { .. } => self.to_string(),
        }
    }
}

impl From<TransportError> for SubmitError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::SessionGone(msg) => SubmitError::SessionExpired(msg),
            TransportError::Unauthorized { .. } => SubmitError::Security(e.to_string()),
            TransportError::Rejected { .. } => SubmitError::Rejected(e.to_string()),
            other => SubmitError::Transfer(other.to_string()),
        }
    }
}

impl From<SecurityError> for SubmitError {
    fn from(e: SecurityError) -> Self {
        SubmitError::Security(e.to_string())
    }
}

impl From<QueueError> for SubmitError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Storage(e) => SubmitError::Storage(e),
            QueueError::NotFound(id) => SubmitError::NotFound(id),
            QueueError::AlreadyExists(id) => SubmitError::Duplicate(id),
            QueueError::InvalidTransition { id, from, to } => SubmitError::InvalidTransition {
                id,
                from: from.to_string(),
                to: to.to_string(),
            },
            QueueError::Busy(id) => SubmitError::Busy(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_source() {
        let quota = SubmitError::from(StorageError::QuotaExceeded {
            needed: 10,
            available: 1,
        });
        assert_eq!(quota.kind(), ErrorKind::QuotaExceeded);
        assert!(!quota.is_retryable());

        let gone = SubmitError::from(TransportError::SessionGone("x".into()));
        assert_eq!(gone.kind(), ErrorKind::SessionExpired);
        assert!(gone.is_retryable());

        let refused = SubmitError::from(TransportError::from_status(413, "too large"));
        assert_eq!(refused.kind(), ErrorKind::TransferFailed);
        assert!(!refused.is_retryable());

        let denied = SubmitError::from(SecurityError::MissingSecret);
        assert_eq!(denied.kind(), ErrorKind::SecurityRejected);
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_offline_message_is_reassuring() {
        let err = SubmitError::BreakerOpen {
            endpoint: "https://relay".into(),
            retry_after: Duration::from_secs(30),
        };
        assert!(err.user_message().starts_with("Saved on this device"));
    }
}
