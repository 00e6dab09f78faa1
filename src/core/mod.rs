//! Client-side submission logic.
//!
//! This module contains:
//! - Queue: durable local record store
//! - Tier: network classification
//! - Breaker: per-endpoint circuit breakers
//! - Transfer: resumable chunked upload client
//! - Orchestrator: queue draining and outcome bookkeeping

pub mod breaker;
pub mod clock;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod security;
pub mod tier;
pub mod transfer;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerState, CircuitBreakers, Decision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SubmitError;
pub use orchestrator::{DrainReport, DrainResult, Orchestrator, Trigger};
pub use queue::{QueueError, QueueStatus, SubmissionQueue, DEFAULT_MAX_PAYLOAD_BYTES};
pub use retry::RetryPolicy;
pub use security::{RequestVerifier, SecurityError, SecurityHeaders};
pub use tier::{Classification, TierClassifier};
pub use transfer::{ProgressSink, TransferClient, TransferOutcome};
