//! Domain types for capture-relay.
//!
//! This module contains the core data structures:
//! - Record: durable local submission state
//! - Tier: network classification and per-tier transfer policy
//! - Artifact: server-side finalized submissions
//! - Errors: failure taxonomy

pub mod artifact;
pub mod errors;
pub mod record;
pub mod tier;

// Re-export commonly used types
pub use artifact::{Artifact, CompletionNotification, CompletionResult, CompletionStatus};
pub use errors::ErrorKind;
pub use record::{now_ms, RecordPatch, RecordState, SessionInfo, SubmissionRecord};
pub use tier::{NetworkTier, TierSettings, TierTable};
