//! capture-relay - offline-first resilient audio submission
//!
//! Recordings are written to a durable local queue first and uploaded later
//! over a resumable, chunked protocol. Network quality picks the chunk size
//! and timeouts, a per-endpoint circuit breaker stops hammering a failing
//! server, and an idempotent completion handshake turns each finished upload
//! into exactly one server-side artifact.
//!
//! # Modules
//!
//! - `storage`: key-value backends (SQLite, in-memory)
//! - `core`: queue, tier classifier, breaker, transfer client, orchestrator
//! - `adapters`: upload transports (HTTP, in-process loopback)
//! - `server`: upload sessions, artifact store, completion handshake
//! - `domain`: records, tiers, artifacts, error kinds
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue a recording and try to upload it right away
//! capture-relay enqueue memo.m4a --title "Standup" --now
//!
//! # Keep draining until interrupted
//! capture-relay watch
//!
//! # Inspect the queue
//! capture-relay status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, SubmissionQueue, SubmitError, TierClassifier, TransferClient};
pub use domain::{ErrorKind, NetworkTier, RecordState, SubmissionRecord};
pub use server::RelayServer;
