//! Submission orchestrator.
//!
//! Drains the local queue: classifies the network once per pass, then
//! attempts each eligible record in order, recording every outcome back
//! into the queue. Only one pass runs at a time; a trigger that arrives
//! while a pass is active is dropped, not queued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::breaker::{CircuitBreakers, Decision};
use super::clock::{Clock, SystemClock};
use super::error::SubmitError;
use super::queue::{QueueError, QueueStatus, SubmissionQueue};
use super::retry::RetryPolicy;
use super::tier::TierClassifier;
use super::transfer::{TransferClient, TransferOutcome};
use crate::domain::{ErrorKind, NetworkTier, RecordPatch, RecordState, SubmissionRecord, TierSettings};

/// Default pause between periodic drain passes
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// Events that wake the drain loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Connectivity came back
    Reconnect,
    /// A new record was enqueued
    Enqueued,
    /// Stop the loop
    Shutdown,
}

/// What a single drain pass did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    pub tier: NetworkTier,
    pub kbps: Option<f64>,
    pub attempted: usize,
    pub completed: usize,
    pub paused: usize,
    pub failed: usize,
    pub needs_attention: usize,
    /// Set when the pass stopped because the endpoint's breaker is open
    pub breaker_retry_after: Option<Duration>,
}

impl DrainReport {
    fn new(tier: NetworkTier, kbps: Option<f64>) -> Self {
        Self {
            tier,
            kbps,
            attempted: 0,
            completed: 0,
            paused: 0,
            failed: 0,
            needs_attention: 0,
            breaker_retry_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainResult {
    Finished(DrainReport),
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Completed,
    Paused,
    Failed,
    NeedsAttention,
    BreakerOpen(Duration),
    Skipped,
}

#[derive(Clone)]
struct InFlight {
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Clears the draining flag however the pass ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Main submission orchestrator
pub struct Orchestrator {
    queue: Arc<SubmissionQueue>,
    classifier: TierClassifier,
    transfer: TransferClient,
    breakers: Arc<CircuitBreakers>,
    clock: Arc<dyn Clock>,
    drain_interval: Duration,
    draining: AtomicBool,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        classifier: TierClassifier,
        transfer: TransferClient,
        breakers: Arc<CircuitBreakers>,
    ) -> Self {
        Self {
            queue,
            classifier,
            transfer,
            breakers,
            clock: Arc::new(SystemClock),
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            draining: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        &self.queue
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> Result<QueueStatus, SubmitError> {
        Ok(self.queue.status()?)
    }

    /// Run one pass over the eligible records
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainResult, SubmitError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return Ok(DrainResult::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.draining);

        let classification = self.classifier.classify().await;
        let tier = self.classifier.settings(classification.tier).clone();
        let mut report = DrainReport::new(classification.tier, classification.kbps);
        let mut seen = HashSet::new();

        loop {
            let now = self.clock.epoch_ms();
            let next = self
                .queue
                .eligible(now)?
                .into_iter()
                .find(|r| !seen.contains(&r.id));
            let Some(record) = next else {
                break;
            };
            seen.insert(record.id.clone());

            if let Decision::Deny { retry_after } = self.breakers.peek(self.transfer.endpoint()) {
                info!(?retry_after, "Endpoint circuit open, ending drain pass");
                report.breaker_retry_after = Some(retry_after);
                break;
            }

            report.attempted += 1;
            match self.attempt(&record.id, &tier).await? {
                Attempt::Completed => report.completed += 1,
                Attempt::Paused => report.paused += 1,
                Attempt::Failed => report.failed += 1,
                Attempt::NeedsAttention => report.needs_attention += 1,
                Attempt::BreakerOpen(retry_after) => {
                    report.paused += 1;
                    report.breaker_retry_after = Some(retry_after);
                    break;
                }
                Attempt::Skipped => report.attempted -= 1,
            }
        }

        info!(
            tier = %report.tier,
            attempted = report.attempted,
            completed = report.completed,
            failed = report.failed,
            "Drain pass finished"
        );
        Ok(DrainResult::Finished(report))
    }

    async fn attempt(&self, id: &str, tier: &TierSettings) -> Result<Attempt, SubmitError> {
        // Claim and register under one lock so `cancel` never misses a claim
        let (mut record, entry) = {
            let mut in_flight = self.lock_in_flight();
            let claimed = self.queue.update_state(
                id,
                RecordState::Uploading,
                RecordPatch {
                    last_error: Some(None),
                    ..Default::default()
                },
            );
            let record = match claimed {
                Ok(record) => record,
                Err(QueueError::NotFound(_)) | Err(QueueError::InvalidTransition { .. }) => {
                    debug!(id, "Record changed before it could be claimed");
                    return Ok(Attempt::Skipped);
                }
                Err(e) => return Err(e.into()),
            };
            let entry = InFlight {
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
            };
            in_flight.insert(id.to_string(), entry.clone());
            (record, entry)
        };

        let result = match self.queue.load_payload(&record) {
            Ok(payload) => {
                self.transfer
                    .upload(&mut record, &payload, tier, &entry.cancel, self.queue.as_ref())
                    .await
            }
            Err(e) => Err(e.into()),
        };
        let settled = self.settle(&record, result, tier);

        self.lock_in_flight().remove(id);
        entry.done.cancel();
        settled
    }

    fn settle(
        &self,
        record: &SubmissionRecord,
        result: Result<TransferOutcome, SubmitError>,
        tier: &TierSettings,
    ) -> Result<Attempt, SubmitError> {
        let id = record.id.as_str();
        let now = self.clock.epoch_ms();

        let err = match result {
            Ok(outcome) => {
                self.queue.update_state(
                    id,
                    RecordState::Completed,
                    RecordPatch {
                        artifact_id: outcome.artifact_id,
                        last_error: Some(None),
                        ..Default::default()
                    },
                )?;
                return Ok(Attempt::Completed);
            }
            Err(err) => err,
        };

        match err {
            SubmitError::Cancelled => {
                self.queue
                    .update_state(id, RecordState::Paused, RecordPatch::error("cancelled"))?;
                Ok(Attempt::Paused)
            }
            SubmitError::BreakerOpen { retry_after, .. } => {
                self.queue.update_state(
                    id,
                    RecordState::Paused,
                    RecordPatch {
                        next_attempt_at: Some(now + retry_after.as_millis() as i64),
                        ..RecordPatch::error(err.to_string())
                    },
                )?;
                Ok(Attempt::BreakerOpen(retry_after))
            }
            SubmitError::Storage(e) => {
                error!(id, error = %e, "Local storage failed during upload");
                // Best effort; the record is parked as interrupted on restart otherwise
                if let Err(write_err) =
                    self.queue
                        .update_state(id, RecordState::Failed, RecordPatch::error(e.to_string()))
                {
                    warn!(id, error = %write_err, "Could not record storage failure");
                }
                Err(SubmitError::Storage(e))
            }
            err if err.kind() == ErrorKind::SecurityRejected => {
                warn!(id, error = %err, "Upload rejected, needs attention");
                self.queue.update_state(
                    id,
                    RecordState::Failed,
                    RecordPatch {
                        retryable: Some(false),
                        ..RecordPatch::error(err.to_string())
                    },
                )?;
                Ok(Attempt::NeedsAttention)
            }
            err => {
                let attempts = record.attempt_count + 1;
                let policy = RetryPolicy::for_tier(tier);
                let retryable = err.is_retryable() && policy.should_retry(attempts);
                let next_attempt_at = if retryable {
                    now + policy.delay_for_attempt(attempts).as_millis() as i64
                } else {
                    0
                };
                let session = if err.kind() == ErrorKind::SessionExpired {
                    Some(None)
                } else {
                    None
                };

                warn!(id, attempts, retryable, error = %err, "Upload attempt failed");
                self.queue.update_state(
                    id,
                    RecordState::Failed,
                    RecordPatch {
                        attempt_count: Some(attempts),
                        next_attempt_at: Some(next_attempt_at),
                        retryable: Some(retryable),
                        session,
                        ..RecordPatch::error(err.to_string())
                    },
                )?;
                Ok(if retryable {
                    Attempt::Failed
                } else {
                    Attempt::NeedsAttention
                })
            }
        }
    }

    /// Stop any in-flight transfer of `id` and delete the record
    pub async fn cancel(&self, id: &str) -> Result<SubmissionRecord, SubmitError> {
        loop {
            let done = {
                let in_flight = self.lock_in_flight();
                match in_flight.get(id) {
                    None => {
                        let removed = self.queue.remove(id)?;
                        info!(id, "Submission cancelled");
                        return Ok(removed);
                    }
                    Some(entry) => {
                        entry.cancel.cancel();
                        entry.done.clone()
                    }
                }
            };
            debug!(id, "Waiting for in-flight transfer to stop");
            done.cancelled().await;
        }
    }

    /// Drain on every trigger and on a fixed interval until shutdown
    pub async fn run(&self, mut triggers: mpsc::Receiver<Trigger>) -> Result<(), SubmitError> {
        self.queue.recover_interrupted()?;

        let mut ticker = tokio::time::interval(self.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                trigger = triggers.recv() => match trigger {
                    Some(Trigger::Shutdown) | None => {
                        info!("Submission loop stopping");
                        break;
                    }
                    Some(trigger) => debug!(?trigger, "Drain triggered"),
                },
            }

            match self.drain().await {
                Ok(DrainResult::Finished(report)) if report.attempted > 0 => {
                    debug!(?report, "Drain report");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Drain pass failed: {}", e.user_message()),
            }
        }

        Ok(())
    }
}
