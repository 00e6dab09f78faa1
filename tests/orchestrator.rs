//! Orchestrator Integration Tests
//!
//! End-to-end drains against the local relay: state transitions, local
//! quota, missing credentials, re-entrancy and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use capture_relay::core::security::payload_hash;
use capture_relay::core::{BreakerConfig, DrainReport, DrainResult, Orchestrator, SubmitError, Trigger};
use capture_relay::domain::{ErrorKind, RecordState};
use capture_relay::server::ServerSettings;
use capture_relay::storage::{StorageBackend, StorageError};
use tokio::sync::mpsc;

use common::{payload, small_chunk_tiers, Harness, SECRET};

async fn finished(orchestrator: &Orchestrator) -> DrainReport {
    match orchestrator.drain().await.unwrap() {
        DrainResult::Finished(report) => report,
        DrainResult::AlreadyRunning => panic!("no other drain was running"),
    }
}

#[tokio::test]
async fn test_drain_completes_and_frees_payload() {
    let h = Harness::new().await;
    let data = payload(420);
    let record = h.submit(&data);
    assert_eq!(record.state, RecordState::Queued);

    let report = finished(&h.orchestrator).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.completed, 1);

    let done = h.record(&record.id);
    assert_eq!(done.state, RecordState::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.session.is_none());
    assert!(done.last_error.is_none());
    assert!(h.backend.get(&done.payload_ref).unwrap().is_none());

    let artifact_id = done.artifact_id.unwrap();
    let artifact = h
        .server
        .completion()
        .artifacts()
        .get(&artifact_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.record_id.as_deref(), Some(record.id.as_str()));
    assert_eq!(artifact.size_bytes, 420);
    assert_eq!(artifact.payload_hash, payload_hash(&data));
    assert_eq!(artifact.metadata.get("title").map(String::as_str), Some("field recording"));

    // Nothing left to do
    assert_eq!(finished(&h.orchestrator).await.attempted, 0);
}

#[tokio::test]
async fn test_oversized_payload_rejected_before_persisting() {
    let h = Harness::new().await;
    let big = vec![0u8; 6 * 1024 * 1024];

    let err = h
        .queue
        .submit(&big, Default::default())
        .unwrap_err();
    let err = SubmitError::from(err);

    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(h.queue.list().unwrap().is_empty());
    assert_eq!(h.backend.used_bytes().unwrap(), 0);
}

#[tokio::test]
async fn test_missing_secret_needs_attention_without_network() {
    let h = Harness::build("", small_chunk_tiers(), BreakerConfig::default()).await;
    let record = h.submit(&payload(64));

    let report = finished(&h.orchestrator).await;
    assert_eq!(report.needs_attention, 1);

    let failed = h.record(&record.id);
    assert_eq!(failed.state, RecordState::Failed);
    assert!(failed.needs_attention());
    assert!(failed.last_error.is_some());
    assert_eq!(h.transport.network_calls(), 0);

    // Not retried automatically
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(finished(&h.orchestrator).await.attempted, 0);
    assert_eq!(h.orchestrator.status().unwrap().needs_attention, 1);
}

#[tokio::test]
async fn test_concurrent_drain_is_rejected() {
    let h = Harness::new().await;
    h.submit(&payload(300));
    h.transport.set_patch_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(h.orchestrator.drain(), h.orchestrator.drain());

    assert!(matches!(first.unwrap(), DrainResult::Finished(r) if r.completed == 1));
    assert_eq!(second.unwrap(), DrainResult::AlreadyRunning);
    assert!(!h.orchestrator.is_draining());
    assert_eq!(h.artifact_count().await, 1);
}

#[tokio::test]
async fn test_cancel_stops_inflight_upload() {
    let h = Harness::new().await;
    let record = h.submit(&payload(1000));
    h.transport.set_patch_delay(Duration::from_millis(200));

    let orchestrator = h.orchestrator.clone();
    let drain = tokio::spawn(async move { orchestrator.drain().await });

    // Wait for the transfer to be claimed
    for _ in 0..100 {
        if h.record(&record.id).state == RecordState::Uploading {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.record(&record.id).state, RecordState::Uploading);

    let removed = h.orchestrator.cancel(&record.id).await.unwrap();
    assert_eq!(removed.id, record.id);

    let report = match drain.await.unwrap().unwrap() {
        DrainResult::Finished(report) => report,
        DrainResult::AlreadyRunning => panic!("no other drain was running"),
    };
    assert_eq!(report.paused, 1);
    assert!(h.queue.get(&record.id).unwrap().is_none());
    assert!(h.backend.get(&record.payload_ref).unwrap().is_none());
    assert_eq!(h.artifact_count().await, 0);
}

#[tokio::test]
async fn test_cancel_queued_record() {
    let h = Harness::new().await;
    let record = h.submit(&payload(10));

    h.orchestrator.cancel(&record.id).await.unwrap();
    assert!(h.queue.list().unwrap().is_empty());

    let err = h.orchestrator.cancel(&record.id).await.unwrap_err();
    assert!(matches!(err, SubmitError::NotFound(_)));
}

#[tokio::test]
async fn test_run_recovers_interrupted_and_drains_on_trigger() {
    let h = Harness::new().await;
    let interrupted = h.submit(&payload(150));
    h.queue
        .update_state(&interrupted.id, RecordState::Uploading, Default::default())
        .unwrap();

    let (tx, rx) = mpsc::channel(8);
    let orchestrator: Arc<Orchestrator> = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run(rx).await });

    let fresh = h.submit(&payload(90));
    tx.send(Trigger::Enqueued).await.unwrap();

    for _ in 0..200 {
        let status = h.queue.status().unwrap();
        if status.completed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(Trigger::Shutdown).await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(h.record(&interrupted.id).state, RecordState::Completed);
    assert_eq!(h.record(&fresh.id).state, RecordState::Completed);
    assert_eq!(h.artifact_count().await, 2);
}

#[tokio::test]
async fn test_transfer_failure_backs_off_then_succeeds() {
    let h = Harness::new().await;
    let record = h.submit(&payload(200));
    h.transport.drop_patch_at(0);

    let report = finished(&h.orchestrator).await;
    assert_eq!(report.failed, 1);

    let failed = h.record(&record.id);
    assert_eq!(failed.state, RecordState::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.retryable);
    assert!(failed.next_attempt_at > failed.updated_at);

    // Still backing off
    assert_eq!(finished(&h.orchestrator).await.attempted, 0);

    h.clock.advance(Duration::from_secs(60));
    let report = finished(&h.orchestrator).await;
    assert_eq!(report.completed, 1);
    assert_eq!(h.record(&record.id).state, RecordState::Completed);
}

#[tokio::test]
async fn test_storage_failure_mid_drain_surfaces() {
    let h = Harness::new().await;
    let record = h.submit(&payload(300));
    h.transport.set_patch_delay(Duration::from_millis(100));

    let orchestrator = h.orchestrator.clone();
    let drain = tokio::spawn(async move { orchestrator.drain().await });

    for _ in 0..100 {
        if h.record(&record.id).state == RecordState::Uploading {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.backend
        .fail_with(Some(StorageError::Unavailable("disk unplugged".into())));

    let err = drain.await.unwrap().unwrap_err();
    assert!(matches!(err, SubmitError::Storage(StorageError::Unavailable(_))));
    assert!(!h.orchestrator.is_draining());

    // The failure could not be written either; a restart parks the record
    h.backend.fail_with(None);
    assert_eq!(h.record(&record.id).state, RecordState::Uploading);
    assert_eq!(h.queue.recover_interrupted().unwrap(), 1);
    assert_eq!(h.record(&record.id).state, RecordState::Paused);
}

#[tokio::test]
async fn test_payload_refused_by_server_is_not_retried() {
    let settings = ServerSettings {
        shared_secret: SECRET.to_string(),
        session_ttl_secs: 600,
        max_upload_bytes: 100,
        ..Default::default()
    };
    let h = Harness::build_with(SECRET, small_chunk_tiers(), BreakerConfig::default(), settings)
        .await;
    let record = h.submit(&payload(300));

    let report = finished(&h.orchestrator).await;
    assert_eq!(report.needs_attention, 1);

    let refused = h.record(&record.id);
    assert_eq!(refused.state, RecordState::Failed);
    assert_eq!(refused.attempt_count, 1);
    assert!(refused.needs_attention());
    assert!(refused.last_error.as_deref().unwrap_or_default().contains("413"));

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(finished(&h.orchestrator).await.attempted, 0);
    assert_eq!(h.artifact_count().await, 0);
}
