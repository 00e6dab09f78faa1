//! Network tier classifier.
//!
//! Downloads a small probe resource and maps the measured throughput to a
//! tier. Any failure (no secret, timeout, bad status) lands on the most
//! conservative tier instead of an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::security::SecurityHeaders;
use crate::adapters::UploadTransport;
use crate::domain::{NetworkTier, TierSettings, TierTable};

/// Result of one classification
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub tier: NetworkTier,
    /// Measured throughput, absent when the probe failed
    pub kbps: Option<f64>,
}

impl Classification {
    fn fallback() -> Self {
        Self {
            tier: NetworkTier::FALLBACK,
            kbps: None,
        }
    }
}

/// Throughput in kilobits per second
pub fn measure(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    (bytes as f64 * 8.0) / 1000.0 / secs
}

pub struct TierClassifier {
    transport: Arc<dyn UploadTransport>,
    probe_url: String,
    secret: String,
    tiers: TierTable,
    clock: Arc<dyn Clock>,
}

impl TierClassifier {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        probe_url: impl Into<String>,
        secret: impl Into<String>,
        tiers: TierTable,
    ) -> Self {
        Self {
            transport,
            probe_url: probe_url.into(),
            secret: secret.into(),
            tiers,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn settings(&self, tier: NetworkTier) -> &TierSettings {
        self.tiers.get(tier)
    }

    pub fn get_timeout_for_tier(&self, tier: NetworkTier) -> Duration {
        self.tiers.get(tier).timeout()
    }

    /// Probe the network and pick a tier
    pub async fn classify(&self) -> Classification {
        let headers = match SecurityHeaders::sign(&self.secret, b"", self.clock.epoch_ms() / 1000) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(error = %e, "Skipping network probe");
                return Classification::fallback();
            }
        };

        // Bounded by the slowest tier's timeout
        let timeout = self.get_timeout_for_tier(NetworkTier::FALLBACK);
        let started = Instant::now();
        let probe = tokio::time::timeout(
            timeout,
            self.transport.probe(&self.probe_url, &headers, timeout),
        )
        .await;

        let bytes = match probe {
            Ok(Ok(bytes)) if bytes > 0 => bytes,
            Ok(Ok(_)) => {
                warn!("Network probe returned an empty body");
                return Classification::fallback();
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Network probe failed");
                return Classification::fallback();
            }
            Err(_) => {
                warn!(?timeout, "Network probe timed out");
                return Classification::fallback();
            }
        };

        let elapsed = started.elapsed();
        let kbps = measure(bytes, elapsed);
        let tier = NetworkTier::from_kbps(kbps);
        debug!(bytes, ?elapsed, kbps, "Network probe finished");
        info!(%tier, kbps = kbps.round(), "Network classified");

        Classification {
            tier,
            kbps: Some(kbps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_kbps() {
        // 1024 bytes in one second is 8.192 kbps
        let kbps = measure(1024, Duration::from_secs(1));
        assert!((kbps - 8.192).abs() < 1e-9);
        assert_eq!(NetworkTier::from_kbps(kbps), NetworkTier::C);

        let fast = measure(1024, Duration::from_millis(1));
        assert_eq!(NetworkTier::from_kbps(fast), NetworkTier::A);
    }

    #[test]
    fn test_zero_elapsed_is_finite() {
        assert!(measure(1024, Duration::ZERO).is_finite());
    }
}
