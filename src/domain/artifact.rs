//! Server-side artifacts produced by the completion handshake.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A finalized submission in permanent storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Server-assigned artifact id
    pub artifact_id: String,

    /// Upload session this artifact was finalized from
    pub session_id: String,

    /// Client record id, when the client declared one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Size of the stored payload
    pub size_bytes: u64,

    /// SHA-256 of the stored payload (hex)
    pub payload_hash: String,

    /// Metadata sent with the completion notification
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,
}

/// Body of the completion webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionNotification {
    pub session_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Outcome of a completion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Created,
    AlreadyFinalized,
}

/// Response of the completion webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub artifact_id: String,
    pub status: CompletionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_result_wire_format() {
        let result = CompletionResult {
            artifact_id: "art-1".to_string(),
            status: CompletionStatus::AlreadyFinalized,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"artifact_id":"art-1","status":"already_finalized"}"#);
    }

    #[test]
    fn test_notification_metadata_defaults_to_empty() {
        let parsed: CompletionNotification =
            serde_json::from_str(r#"{"session_id":"s1"}"#).unwrap();
        assert_eq!(parsed.session_id, "s1");
        assert!(parsed.metadata.is_empty());
    }
}
