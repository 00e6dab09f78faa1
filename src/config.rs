//! Configuration for capture-relay.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CAPTURE_RELAY_HOME, CAPTURE_RELAY_ENDPOINT, CAPTURE_RELAY_SECRET)
//! 2. Config file (.capture-relay/config.yaml)
//! 3. Defaults (~/.capture-relay, local relay endpoint)
//!
//! Config file discovery:
//! - Searches current directory and parents for .capture-relay/config.yaml
//! - `paths.home` is relative to the .capture-relay/ directory

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::loopback::LOOPBACK_BASE;
use crate::core::breaker::BreakerConfig;
use crate::core::orchestrator::DEFAULT_DRAIN_INTERVAL;
use crate::core::queue::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::domain::TierTable;
use crate::server::ServerSettings;

pub const CONFIG_DIR: &str = ".capture-relay";
pub const ENV_HOME: &str = "CAPTURE_RELAY_HOME";
pub const ENV_ENDPOINT: &str = "CAPTURE_RELAY_ENDPOINT";
pub const ENV_SECRET: &str = "CAPTURE_RELAY_SECRET";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    pub endpoint: Option<String>,
    pub webhook: Option<String>,
    pub probe_url: Option<String>,
    pub shared_secret: Option<String>,
    /// Largest payload accepted into the local queue
    pub max_payload_bytes: Option<u64>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Settings for the local relay (loopback endpoint)
    #[serde(default)]
    pub server: Option<ServerSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .capture-relay/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

fn default_drain_interval_secs() -> u64 {
    DEFAULT_DRAIN_INTERVAL.as_secs()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,
    /// Upload session endpoint
    pub endpoint: String,
    /// Completion webhook
    pub webhook: String,
    /// Throughput probe resource
    pub probe_url: String,
    /// Shared secret (may be empty; uploads then fail with SECURITY_REJECTED)
    #[serde(skip_serializing)]
    pub shared_secret: String,
    /// Enqueue-time cap on one payload
    pub max_payload_bytes: u64,
    pub tiers: TierTable,
    pub breaker: BreakerConfig,
    pub drain_interval: Duration,
    /// Local relay settings; its secret mirrors `shared_secret` unless set
    #[serde(skip_serializing)]
    pub server: ServerSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Whether uploads go to the in-process relay instead of the network
    pub fn is_loopback(&self) -> bool {
        self.endpoint.starts_with(LOOPBACK_BASE)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Build the resolved config from an optional parsed file
fn resolve(file: Option<(PathBuf, ConfigFile)>, default_home: PathBuf) -> Result<ResolvedConfig> {
    let (config_file, parsed) = match file {
        Some((path, parsed)) => (Some(path), Some(parsed)),
        None => (None, None),
    };

    let home = if let Some(env_home) = env_nonempty(ENV_HOME) {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home)) = (
        config_file.as_ref(),
        parsed.as_ref().and_then(|c| c.paths.home.as_ref()),
    ) {
        let config_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home)
    } else {
        default_home
    };

    let endpoint = env_nonempty(ENV_ENDPOINT)
        .or_else(|| parsed.as_ref().and_then(|c| c.endpoint.clone()))
        .unwrap_or_else(|| format!("{}/uploads", LOOPBACK_BASE));
    let endpoint = endpoint.trim_end_matches('/').to_string();

    let webhook = parsed
        .as_ref()
        .and_then(|c| c.webhook.clone())
        .unwrap_or_else(|| format!("{}/complete", endpoint));
    let probe_url = parsed
        .as_ref()
        .and_then(|c| c.probe_url.clone())
        .unwrap_or_else(|| format!("{}/probe", endpoint));

    let shared_secret = env_nonempty(ENV_SECRET)
        .or_else(|| parsed.as_ref().and_then(|c| c.shared_secret.clone()))
        .unwrap_or_default();

    let max_payload_bytes = parsed
        .as_ref()
        .and_then(|c| c.max_payload_bytes)
        .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);
    if max_payload_bytes == 0 {
        anyhow::bail!("max_payload_bytes must be positive");
    }

    let (tiers, breaker, orchestrator, server) = match parsed {
        Some(c) => (c.tiers, c.breaker, c.orchestrator, c.server),
        None => Default::default(),
    };

    tiers
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid tier table: {}", e))?;

    let mut server = server.unwrap_or_default();
    if server.shared_secret.is_empty() {
        server.shared_secret = shared_secret.clone();
    }

    Ok(ResolvedConfig {
        home,
        endpoint,
        webhook,
        probe_url,
        shared_secret,
        max_payload_bytes,
        tiers,
        breaker,
        drain_interval: Duration::from_secs(orchestrator.drain_interval_secs.max(1)),
        server,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let file = match find_config_file() {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    resolve(file, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the capture-relay home directory
pub fn relay_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
