//! Completion Handshake Integration Tests
//!
//! Duplicate and concurrent completion notifications for one session
//! produce exactly one artifact.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use capture_relay::core::security::SecurityHeaders;
use capture_relay::core::{Clock, ManualClock};
use capture_relay::domain::{CompletionNotification, CompletionStatus};
use capture_relay::protocol::create_signing_bytes;
use capture_relay::server::{RelayServer, ServerSettings};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{payload, Harness, SECRET};

async fn server() -> (RelayServer, Arc<ManualClock>, TempDir) {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new());
    let server = RelayServer::open_with_clock(
        temp.path(),
        ServerSettings {
            shared_secret: SECRET.to_string(),
            ..Default::default()
        },
        clock.clone(),
    )
    .await
    .unwrap();
    (server, clock, temp)
}

fn sign(clock: &ManualClock, body: &[u8]) -> SecurityHeaders {
    SecurityHeaders::sign(SECRET, body, clock.epoch_ms() / 1000).unwrap()
}

/// Create a session and upload `data` into it in one piece
async fn uploaded_session(server: &RelayServer, clock: &ManualClock, data: &[u8]) -> String {
    let len = data.len() as u64;
    let session = server
        .uploads()
        .create(&sign(clock, &create_signing_bytes(len, "")), len, "")
        .await
        .unwrap();
    server
        .uploads()
        .append(&sign(clock, data), &session.id, 0, data)
        .await
        .unwrap();
    session.id
}

fn notification(session_id: &str) -> Vec<u8> {
    serde_json::to_vec(&CompletionNotification {
        session_id: session_id.to_string(),
        metadata: BTreeMap::new(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_concurrent_completions_create_one_artifact() {
    let (server, clock, _temp) = server().await;
    let session_id = uploaded_session(&server, &clock, &payload(500)).await;
    let body = notification(&session_id);

    let handler = server.completion().clone();
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let handler = handler.clone();
            let body = body.clone();
            let headers = sign(&clock, &body);
            tokio::spawn(async move { handler.receive(&headers, &body).await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    let created = results
        .iter()
        .filter(|r| r.status == CompletionStatus::Created)
        .count();
    assert_eq!(created, 1);
    assert!(results
        .iter()
        .all(|r| r.artifact_id == results[0].artifact_id));
    assert_eq!(
        server.completion().artifacts().list().await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_sequential_duplicate_returns_prior_artifact() {
    let (server, clock, _temp) = server().await;
    let session_id = uploaded_session(&server, &clock, b"hello relay").await;
    let body = notification(&session_id);

    let first = server
        .completion()
        .receive(&sign(&clock, &body), &body)
        .await
        .unwrap();
    let second = server
        .completion()
        .receive(&sign(&clock, &body), &body)
        .await
        .unwrap();

    assert_eq!(first.status, CompletionStatus::Created);
    assert_eq!(second.status, CompletionStatus::AlreadyFinalized);
    assert_eq!(first.artifact_id, second.artifact_id);
}

#[tokio::test]
async fn test_sessions_finalize_independently() {
    let (server, clock, _temp) = server().await;
    let a = uploaded_session(&server, &clock, b"first").await;
    let b = uploaded_session(&server, &clock, b"second").await;
    let body_a = notification(&a);
    let body_b = notification(&b);

    let headers_a = sign(&clock, &body_a);
    let headers_b = sign(&clock, &body_b);
    let (ra, rb) = tokio::join!(
        server.completion().receive(&headers_a, &body_a),
        server.completion().receive(&headers_b, &body_b),
    );

    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.status, CompletionStatus::Created);
    assert_eq!(rb.status, CompletionStatus::Created);
    assert_ne!(ra.artifact_id, rb.artifact_id);
}

#[tokio::test]
async fn test_finalized_session_rejects_more_bytes() {
    let (server, clock, _temp) = server().await;
    let session_id = uploaded_session(&server, &clock, b"abc").await;
    let body = notification(&session_id);
    server
        .completion()
        .receive(&sign(&clock, &body), &body)
        .await
        .unwrap();

    let err = server
        .uploads()
        .append(&sign(&clock, b"d"), &session_id, 3, b"d")
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

#[tokio::test]
async fn test_client_treats_repeat_completion_as_success() {
    let h = Harness::new().await;
    let data = payload(250);
    let mut record = h.submit(&data);
    let client = h.transfer_client(SECRET);
    let cancel = CancellationToken::new();

    let first = client
        .upload(&mut record, &data, &h.tiers.a, &cancel, h.queue.as_ref())
        .await
        .unwrap();

    // Same session again: the probe reports every byte held, so only the
    // completion call is repeated
    let patches_before = h.transport.delivered_patches().len();
    let second = client
        .upload(&mut record, &data, &h.tiers.a, &cancel, h.queue.as_ref())
        .await
        .unwrap();

    assert_eq!(first.status, CompletionStatus::Created);
    assert_eq!(second.status, CompletionStatus::AlreadyFinalized);
    assert_eq!(first.artifact_id, second.artifact_id);
    assert_eq!(second.bytes_sent, 0);
    assert_eq!(h.transport.delivered_patches().len(), patches_before);
    assert_eq!(h.artifact_count().await, 1);
}
