//! Shared fixtures: a relay server in a temp dir and a transport that can
//! be told to misbehave.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use capture_relay::adapters::{
    CreateRequest, CreatedSession, LoopbackTransport, TransportError, UploadTransport,
};
use capture_relay::core::security::SecurityHeaders;
use capture_relay::core::{
    BreakerConfig, CircuitBreakers, ManualClock, Orchestrator, SubmissionQueue, TierClassifier,
    TransferClient, DEFAULT_MAX_PAYLOAD_BYTES,
};
use capture_relay::domain::{CompletionResult, SubmissionRecord, TierSettings, TierTable};
use capture_relay::server::{RelayServer, ServerSettings};
use capture_relay::storage::MemoryBackend;

pub const SECRET: &str = "integration-secret";
pub const ENDPOINT: &str = "loopback://relay/uploads";
pub const WEBHOOK: &str = "loopback://relay/complete";
pub const PROBE_URL: &str = "loopback://relay/probe";

/// Loopback transport with injectable faults
pub struct FlakyTransport {
    inner: LoopbackTransport,
    offline: AtomicBool,
    fail_probe: AtomicBool,
    drop_patch_at: Mutex<Option<u64>>,
    lose_ack_at: Mutex<Option<u64>>,
    patch_delay: Mutex<Duration>,
    calls: AtomicUsize,
    patches: Mutex<Vec<(u64, usize)>>,
}

impl FlakyTransport {
    pub fn new(inner: LoopbackTransport) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            fail_probe: AtomicBool::new(false),
            drop_patch_at: Mutex::new(None),
            lose_ack_at: Mutex::new(None),
            patch_delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            patches: Mutex::new(Vec::new()),
        }
    }

    /// Every request fails with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// The next PATCH at `offset` is lost before reaching the server
    pub fn drop_patch_at(&self, offset: u64) {
        *self.drop_patch_at.lock().unwrap() = Some(offset);
    }

    /// The next PATCH at `offset` reaches the server, but its response is lost
    pub fn lose_ack_at(&self, offset: u64) {
        *self.lose_ack_at.lock().unwrap() = Some(offset);
    }

    pub fn set_patch_delay(&self, delay: Duration) {
        *self.patch_delay.lock().unwrap() = delay;
    }

    /// Requests that were attempted, delivered or not
    pub fn network_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (offset, len) of every PATCH the server actually received
    pub fn delivered_patches(&self) -> Vec<(u64, usize)> {
        self.patches.lock().unwrap().clone()
    }

    fn enter(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UploadTransport for FlakyTransport {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn create(&self, request: CreateRequest) -> Result<CreatedSession, TransportError> {
        self.enter()?;
        self.inner.create(request).await
    }

    async fn head_offset(
        &self,
        location: &str,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<u64, TransportError> {
        self.enter()?;
        self.inner.head_offset(location, headers, timeout).await
    }

    async fn patch(
        &self,
        location: &str,
        offset: u64,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<u64, TransportError> {
        self.enter()?;

        let delay = *self.patch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut drop_at = self.drop_patch_at.lock().unwrap();
            if *drop_at == Some(offset) {
                *drop_at = None;
                return Err(TransportError::Network("connection reset".to_string()));
            }
        }

        let len = body.len();
        let ack = self.inner.patch(location, offset, body, headers, timeout).await?;
        self.patches.lock().unwrap().push((offset, len));

        let mut lose_at = self.lose_ack_at.lock().unwrap();
        if *lose_at == Some(offset) {
            *lose_at = None;
            return Err(TransportError::Network("connection reset after send".to_string()));
        }
        Ok(ack)
    }

    async fn complete(
        &self,
        webhook: &str,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<CompletionResult, TransportError> {
        self.enter()?;
        self.inner.complete(webhook, body, headers, timeout).await
    }

    async fn probe(
        &self,
        url: &str,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.enter()?;
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(timeout));
        }
        self.inner.probe(url, headers, timeout).await
    }
}

/// Tier table with 100-byte chunks everywhere and default timeouts
pub fn small_chunk_tiers() -> TierTable {
    let small = |t: TierSettings| TierSettings {
        chunk_size_bytes: 100,
        ..t
    };
    let defaults = TierTable::default();
    TierTable {
        a: small(defaults.a),
        b: small(defaults.b),
        c: small(defaults.c),
    }
}

/// Client and server wired together over one manual clock
pub struct Harness {
    pub temp: TempDir,
    pub clock: Arc<ManualClock>,
    pub server: RelayServer,
    pub transport: Arc<FlakyTransport>,
    pub backend: Arc<MemoryBackend>,
    pub queue: Arc<SubmissionQueue>,
    pub breakers: Arc<CircuitBreakers>,
    pub orchestrator: Arc<Orchestrator>,
    pub tiers: TierTable,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(SECRET, small_chunk_tiers(), BreakerConfig::default()).await
    }

    pub async fn build(client_secret: &str, tiers: TierTable, breaker: BreakerConfig) -> Self {
        let settings = ServerSettings {
            shared_secret: SECRET.to_string(),
            session_ttl_secs: 600,
            ..Default::default()
        };
        Self::build_with(client_secret, tiers, breaker, settings).await
    }

    pub async fn build_with(
        client_secret: &str,
        tiers: TierTable,
        breaker: BreakerConfig,
        settings: ServerSettings,
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new());
        let server = RelayServer::open_with_clock(temp.path().join("relay"), settings, clock.clone())
            .await
            .unwrap();

        let transport = Arc::new(FlakyTransport::new(server.transport()));
        let backend = Arc::new(MemoryBackend::new());
        let queue = Arc::new(
            SubmissionQueue::new(backend.clone())
                .with_max_payload_bytes(DEFAULT_MAX_PAYLOAD_BYTES)
                .with_clock(clock.clone()),
        );
        let breakers = Arc::new(CircuitBreakers::with_clock(breaker, clock.clone()));

        let classifier = TierClassifier::new(
            transport.clone(),
            PROBE_URL,
            client_secret,
            tiers.clone(),
        )
        .with_clock(clock.clone());
        let transfer = TransferClient::new(
            transport.clone(),
            breakers.clone(),
            ENDPOINT,
            WEBHOOK,
            client_secret,
        )
        .with_clock(clock.clone());
        let orchestrator = Arc::new(
            Orchestrator::new(queue.clone(), classifier, transfer, breakers.clone())
                .with_clock(clock.clone()),
        );

        Self {
            temp,
            clock,
            server,
            transport,
            backend,
            queue,
            breakers,
            orchestrator,
            tiers,
        }
    }

    /// A transfer client sharing this harness' transport, breakers and clock
    pub fn transfer_client(&self, secret: &str) -> TransferClient {
        TransferClient::new(
            self.transport.clone(),
            self.breakers.clone(),
            ENDPOINT,
            WEBHOOK,
            secret,
        )
        .with_clock(self.clock.clone())
    }

    pub fn submit(&self, payload: &[u8]) -> SubmissionRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("title".to_string(), "field recording".to_string());
        self.queue.submit(payload, metadata).unwrap()
    }

    pub fn record(&self, id: &str) -> SubmissionRecord {
        self.queue.get(id).unwrap().unwrap()
    }

    pub async fn artifact_count(&self) -> usize {
        self.server.completion().artifacts().list().await.unwrap().len()
    }
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
