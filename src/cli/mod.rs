//! Command-line interface for capture-relay.
//!
//! Provides commands for queueing recordings, draining the queue, and
//! inspecting or repairing individual submissions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapters::{HttpTransport, UploadTransport};
use crate::config::{self, paths, ResolvedConfig};
use crate::core::{
    CircuitBreakers, DrainResult, Orchestrator, SubmissionQueue, TierClassifier, TransferClient,
    Trigger,
};
use crate::domain::{NetworkTier, RecordState, SubmissionRecord};
use crate::server::RelayServer;
use crate::storage::{QueueLock, SqliteBackend};

/// capture-relay - offline-first resilient audio submission
#[derive(Parser, Debug)]
#[command(name = "capture-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a recording for upload
    Enqueue {
        /// Audio file to submit
        file: PathBuf,

        /// Title stored with the submission
        #[arg(short, long)]
        title: Option<String>,

        /// Extra metadata as key=value (repeatable)
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,

        /// Drain the queue right away
        #[arg(long)]
        now: bool,
    },

    /// Run one drain pass
    Drain,

    /// Drain periodically until interrupted
    Watch,

    /// Show queue counts and breaker state
    Status,

    /// Show one submission
    Show {
        /// Record ID
        id: String,
    },

    /// Cancel a submission and delete it from the queue
    Cancel {
        /// Record ID
        id: String,
    },

    /// Retry a failed or paused submission with a fresh attempt budget
    Retry {
        /// Record ID
        id: String,
    },

    /// Delete completed submissions (and expired relay sessions)
    Purge {
        /// Keep completed records younger than this many days
        #[arg(long, default_value = "7")]
        older_than_days: u32,
    },

    /// Measure the network and print the selected tier
    Probe,

    /// Show resolved configuration (debug)
    Config,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Everything a command needs, wired from the resolved config
struct Stack {
    queue: Arc<SubmissionQueue>,
    breakers: Arc<CircuitBreakers>,
    orchestrator: Orchestrator,
    relay: Option<RelayServer>,
}

async fn open_stack(cfg: &ResolvedConfig) -> Result<Stack> {
    let db_path = paths::queue_db_in(&cfg.home);
    let backend = SqliteBackend::open(&db_path)
        .with_context(|| format!("Failed to open queue database: {}", db_path.display()))?;

    let queue = Arc::new(
        SubmissionQueue::new(Arc::new(backend)).with_max_payload_bytes(cfg.max_payload_bytes),
    );

    // Without a secret nothing is ever sent, and the relay refuses to start
    let relay_enabled = cfg.is_loopback() && !cfg.server.shared_secret.trim().is_empty();
    if cfg.is_loopback() && !relay_enabled {
        warn!("No shared secret configured, local relay disabled");
    }

    let (transport, relay): (Arc<dyn UploadTransport>, Option<RelayServer>) = if relay_enabled {
        let relay_dir = paths::relay_dir_in(&cfg.home);
        let relay = RelayServer::open(&relay_dir, cfg.server.clone())
            .await
            .with_context(|| format!("Failed to open local relay: {}", relay_dir.display()))?;
        (Arc::new(relay.transport()), Some(relay))
    } else {
        (Arc::new(HttpTransport::new()), None)
    };

    let breakers = Arc::new(CircuitBreakers::new(cfg.breaker.clone()));
    let classifier = TierClassifier::new(
        transport.clone(),
        cfg.probe_url.clone(),
        cfg.shared_secret.clone(),
        cfg.tiers.clone(),
    );
    let transfer = TransferClient::new(
        transport,
        breakers.clone(),
        cfg.endpoint.clone(),
        cfg.webhook.clone(),
        cfg.shared_secret.clone(),
    );
    let orchestrator = Orchestrator::new(queue.clone(), classifier, transfer, breakers.clone())
        .with_drain_interval(cfg.drain_interval);

    Ok(Stack {
        queue,
        breakers,
        orchestrator,
        relay,
    })
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Enqueue {
                file,
                title,
                meta,
                now,
            } => enqueue(cfg, file, title, meta, now).await,
            Commands::Drain => drain(cfg).await,
            Commands::Watch => watch(cfg).await,
            Commands::Status => show_status(cfg).await,
            Commands::Show { id } => show_record(cfg, &id).await,
            Commands::Cancel { id } => cancel(cfg, &id).await,
            Commands::Retry { id } => retry(cfg, &id).await,
            Commands::Purge { older_than_days } => purge(cfg, older_than_days).await,
            Commands::Probe => probe(cfg).await,
            Commands::Config => show_config(cfg),
        }
    }
}

async fn enqueue(
    cfg: &ResolvedConfig,
    file: PathBuf,
    title: Option<String>,
    meta: Vec<(String, String)>,
    drain_now: bool,
) -> Result<()> {
    let payload = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read audio file: {}", file.display()))?;

    let mut metadata: BTreeMap<String, String> = meta.into_iter().collect();
    if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
        metadata.entry("filename".to_string()).or_insert_with(|| name.to_string());
    }
    if let Some(title) = title {
        metadata.insert("title".to_string(), title);
    }

    let stack = open_stack(cfg).await?;
    let record = match stack.queue.submit(&payload, metadata) {
        Ok(record) => record,
        Err(e) => {
            let e = crate::core::SubmitError::from(e);
            anyhow::bail!("{} ({})", e.user_message(), e);
        }
    };

    eprintln!("Queued {} ({} bytes)", record.id, record.payload_len);
    println!("{}", record.id);

    if drain_now {
        match try_queue_lock(cfg)? {
            Some(_lock) => {
                stack.queue.recover_interrupted()?;
                report_drain(stack.orchestrator.drain().await?);
            }
            None => eprintln!("Another capture-relay process is uploading; it will pick this up"),
        }
    }
    Ok(())
}

/// Claim the queue for this process. Only the holder uploads, and only the
/// holder may treat `Uploading` records as interrupted.
fn try_queue_lock(cfg: &ResolvedConfig) -> Result<Option<QueueLock>> {
    let path = paths::queue_lock_in(&cfg.home);
    let lock = QueueLock::try_acquire(&path)?;
    if lock.is_none() {
        warn!(path = %path.display(), "Queue is locked by another process");
    }
    Ok(lock)
}

fn require_queue_lock(cfg: &ResolvedConfig) -> Result<QueueLock> {
    try_queue_lock(cfg)?.with_context(|| {
        format!(
            "Another capture-relay process is uploading from {}",
            cfg.home.display()
        )
    })
}

async fn drain(cfg: &ResolvedConfig) -> Result<()> {
    let _lock = require_queue_lock(cfg)?;
    let stack = open_stack(cfg).await?;
    stack.queue.recover_interrupted()?;
    report_drain(stack.orchestrator.drain().await?);
    Ok(())
}

fn report_drain(result: DrainResult) {
    match result {
        DrainResult::AlreadyRunning => eprintln!("A drain pass is already running"),
        DrainResult::Finished(report) => {
            let kbps = report
                .kbps
                .map(|k| format!("{:.0} kbps", k))
                .unwrap_or_else(|| "probe failed".to_string());
            eprintln!("Network tier {} ({})", report.tier, kbps);
            eprintln!(
                "Attempted {}: {} completed, {} failed, {} paused, {} need attention",
                report.attempted,
                report.completed,
                report.failed,
                report.paused,
                report.needs_attention
            );
            if let Some(retry_after) = report.breaker_retry_after {
                eprintln!(
                    "Endpoint unavailable; next attempt in {}s",
                    retry_after.as_secs().max(1)
                );
            }
        }
    }
}

async fn watch(cfg: &ResolvedConfig) -> Result<()> {
    let _lock = require_queue_lock(cfg)?;
    let stack = open_stack(cfg).await?;
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Trigger::Shutdown).await;
        }
    });

    info!(interval = ?cfg.drain_interval, endpoint = %cfg.endpoint, "Watching submission queue");
    stack.orchestrator.run(rx).await?;
    Ok(())
}

async fn show_status(cfg: &ResolvedConfig) -> Result<()> {
    let stack = open_stack(cfg).await?;
    let status = stack.queue.status()?;

    println!("Queued:          {}", status.queued);
    println!("Uploading:       {}", status.uploading);
    println!("Paused:          {}", status.paused);
    println!("Failed:          {}", status.failed);
    println!("Needs attention: {}", status.needs_attention);
    println!("Completed:       {}", status.completed);
    println!("Pending bytes:   {}", status.pending_bytes);

    let breaker = stack.breakers.snapshot(&cfg.endpoint);
    println!("Circuit ({}):  {:?}", cfg.endpoint, breaker.state);

    let records = stack.queue.list()?;
    let pending: Vec<_> = records
        .iter()
        .filter(|r| r.state != RecordState::Completed)
        .collect();
    if !pending.is_empty() {
        println!();
        println!("{:<38} {:<10} {:>10} {:>8}", "ID", "STATE", "BYTES", "ATTEMPTS");
        println!("{}", "-".repeat(70));
        for record in pending {
            println!(
                "{:<38} {:<10} {:>10} {:>8}",
                record.id, record.state, record.payload_len, record.attempt_count
            );
        }
    }

    Ok(())
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn print_record(record: &SubmissionRecord) {
    println!("ID:         {}", record.id);
    println!("State:      {}", record.state);
    println!("Bytes:      {}", record.payload_len);
    println!("Attempts:   {}", record.attempt_count);
    println!("Created:    {}", format_ms(record.created_at));
    println!("Updated:    {}", format_ms(record.updated_at));
    if record.next_attempt_at > 0 {
        println!("Next try:   {}", format_ms(record.next_attempt_at));
    }
    if let Some(session) = &record.session {
        println!("Session:    {} (offset {})", session.location, session.offset);
    }
    if let Some(artifact_id) = &record.artifact_id {
        println!("Artifact:   {}", artifact_id);
    }
    if let Some(error) = &record.last_error {
        println!("Last error: {}", error);
    }
    if record.needs_attention() {
        println!("Needs attention: run 'capture-relay retry {}' after fixing the cause", record.id);
    }
    for (key, value) in &record.metadata {
        println!("  {}: {}", key, value);
    }
}

async fn show_record(cfg: &ResolvedConfig, id: &str) -> Result<()> {
    let stack = open_stack(cfg).await?;
    let record = stack
        .queue
        .get(id)?
        .with_context(|| format!("Submission not found: {}", id))?;
    print_record(&record);
    Ok(())
}

async fn cancel(cfg: &ResolvedConfig, id: &str) -> Result<()> {
    let stack = open_stack(cfg).await?;
    // Without the lock, a record mid-upload belongs to its uploader and is refused
    if let Some(_lock) = try_queue_lock(cfg)? {
        stack.queue.recover_interrupted()?;
    }
    let removed = stack.orchestrator.cancel(id).await?;
    eprintln!("Cancelled {} (was {})", removed.id, removed.state);
    Ok(())
}

async fn retry(cfg: &ResolvedConfig, id: &str) -> Result<()> {
    let stack = open_stack(cfg).await?;
    if let Some(_lock) = try_queue_lock(cfg)? {
        stack.queue.recover_interrupted()?;
    }
    let record = stack.queue.requeue(id)?;
    eprintln!("Requeued {}", record.id);
    Ok(())
}

async fn purge(cfg: &ResolvedConfig, older_than_days: u32) -> Result<()> {
    let stack = open_stack(cfg).await?;
    let cutoff = Utc::now().timestamp_millis() - i64::from(older_than_days) * 24 * 60 * 60 * 1000;
    let removed = stack.queue.purge_completed(cutoff)?;
    eprintln!("Purged {} completed submission(s)", removed);

    if let Some(relay) = &stack.relay {
        let sessions = relay.uploads().purge_expired().await?;
        eprintln!("Purged {} expired relay session(s)", sessions);
    }
    Ok(())
}

async fn probe(cfg: &ResolvedConfig) -> Result<()> {
    let stack = open_stack(cfg).await?;
    let transport: Arc<dyn UploadTransport> = match &stack.relay {
        Some(relay) => Arc::new(relay.transport()),
        None => Arc::new(HttpTransport::new()),
    };
    let classifier = TierClassifier::new(
        transport,
        cfg.probe_url.clone(),
        cfg.shared_secret.clone(),
        cfg.tiers.clone(),
    );

    let classification = classifier.classify().await;
    let settings = classifier.settings(classification.tier);
    match classification.kbps {
        Some(kbps) => println!("Tier {} ({:.0} kbps)", classification.tier, kbps),
        None => println!("Tier {} (probe failed)", NetworkTier::FALLBACK),
    }
    println!("  Chunk size:  {} bytes", settings.chunk_size_bytes);
    println!("  Timeout:     {} ms", settings.timeout_ms);
    println!("  Max retries: {}", settings.max_retries);
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("capture-relay configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Queue:       {}", paths::queue_db_in(&cfg.home).display());
    if cfg.is_loopback() {
        println!("  Local relay: {}", paths::relay_dir_in(&cfg.home).display());
    }
    println!();
    println!("Endpoints:");
    println!("  Uploads:  {}", cfg.endpoint);
    println!("  Webhook:  {}", cfg.webhook);
    println!("  Probe:    {}", cfg.probe_url);
    println!(
        "  Secret:   {}",
        if cfg.shared_secret.is_empty() {
            "(not set - uploads will be refused)"
        } else {
            "(set)"
        }
    );
    println!();
    println!("Tiers:");
    for tier in [NetworkTier::A, NetworkTier::B, NetworkTier::C] {
        let s = cfg.tiers.get(tier);
        println!(
            "  {}: chunk {} B, timeout {} ms, {} retries every {} ms+",
            tier, s.chunk_size_bytes, s.timeout_ms, s.max_retries, s.retry_delay_ms
        );
    }
    println!("Max payload: {} B", cfg.max_payload_bytes);
    println!();
    println!("Circuit breaker:");
    println!("  Failure threshold: {}", cfg.breaker.failure_threshold);
    println!("  Cooldown:          {} ms (x{})", cfg.breaker.cooldown_ms, cfg.breaker.cooldown_multiplier);
    println!("Drain interval: {}s", cfg.drain_interval.as_secs());

    Ok(())
}
