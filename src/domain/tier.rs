//! Network tiers and the transfer policy derived from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse network speed classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkTier {
    /// Broadband
    A,
    /// 3G-class
    B,
    /// 2G-class, or unknown
    C,
}

impl NetworkTier {
    /// Most conservative tier, used whenever measurement fails
    pub const FALLBACK: NetworkTier = NetworkTier::C;

    /// Map a measured throughput to a tier
    pub fn from_kbps(kbps: f64) -> Self {
        if !kbps.is_finite() || kbps < 50.0 {
            NetworkTier::C
        } else if kbps < 500.0 {
            NetworkTier::B
        } else {
            NetworkTier::A
        }
    }
}

impl std::fmt::Display for NetworkTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkTier::A => "A",
            NetworkTier::B => "B",
            NetworkTier::C => "C",
        };
        f.write_str(s)
    }
}

/// Transfer policy for one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSettings {
    /// Bytes sent per PATCH request
    pub chunk_size_bytes: u64,

    /// Failed attempts before a record stops retrying automatically
    pub max_retries: u32,

    /// Base backoff delay in milliseconds
    pub retry_delay_ms: u64,

    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl TierSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-tier policy table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_tier_a")]
    pub a: TierSettings,
    #[serde(default = "default_tier_b")]
    pub b: TierSettings,
    #[serde(default = "default_tier_c")]
    pub c: TierSettings,
}

fn default_tier_a() -> TierSettings {
    TierSettings {
        chunk_size_bytes: 1024 * 1024,
        max_retries: 5,
        retry_delay_ms: 1_000,
        timeout_ms: 15_000,
    }
}

fn default_tier_b() -> TierSettings {
    TierSettings {
        chunk_size_bytes: 256 * 1024,
        max_retries: 6,
        retry_delay_ms: 2_000,
        timeout_ms: 30_000,
    }
}

fn default_tier_c() -> TierSettings {
    TierSettings {
        chunk_size_bytes: 64 * 1024,
        max_retries: 8,
        retry_delay_ms: 5_000,
        timeout_ms: 60_000,
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            a: default_tier_a(),
            b: default_tier_b(),
            c: default_tier_c(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: NetworkTier) -> &TierSettings {
        match tier {
            NetworkTier::A => &self.a,
            NetworkTier::B => &self.b,
            NetworkTier::C => &self.c,
        }
    }

    /// Reject tables that would let a slower tier wait less than a faster one
    pub fn validate(&self) -> Result<(), String> {
        if self.c.timeout_ms < self.b.timeout_ms || self.b.timeout_ms < self.a.timeout_ms {
            return Err(format!(
                "tier timeouts must not decrease from A to C (A={}ms, B={}ms, C={}ms)",
                self.a.timeout_ms, self.b.timeout_ms, self.c.timeout_ms
            ));
        }
        for (name, tier) in [("a", &self.a), ("b", &self.b), ("c", &self.c)] {
            if tier.chunk_size_bytes == 0 {
                return Err(format!("tier {} chunk_size_bytes must be positive", name));
            }
            if tier.timeout_ms == 0 {
                return Err(format!("tier {} timeout_ms must be positive", name));
            }
        }
        Ok(())
    }
}
