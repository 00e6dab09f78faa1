//! Error taxonomy shared by the client and the server.

use serde::{Deserialize, Serialize};

/// Kind of failure, independent of the layer that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    StorageUnavailable,
    QuotaExceeded,
    StorageCorrupt,
    BreakerOpen,
    TransferFailed,
    SessionExpired,
    SecurityRejected,
    HandshakeConflict,
}

impl ErrorKind {
    /// Storage and security failures are surfaced to the user immediately
    pub fn surfaces_immediately(self) -> bool {
        matches!(
            self,
            ErrorKind::StorageUnavailable
                | ErrorKind::QuotaExceeded
                | ErrorKind::StorageCorrupt
                | ErrorKind::SecurityRejected
        )
    }

    /// Whether the orchestrator retries this kind automatically
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::BreakerOpen | ErrorKind::TransferFailed | ErrorKind::SessionExpired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::StorageCorrupt => "STORAGE_CORRUPT",
            ErrorKind::BreakerOpen => "BREAKER_OPEN",
            ErrorKind::TransferFailed => "TRANSFER_FAILED",
            ErrorKind::SessionExpired => "SESSION_EXPIRED",
            ErrorKind::SecurityRejected => "SECURITY_REJECTED",
            ErrorKind::HandshakeConflict => "HANDSHAKE_CONFLICT",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
