//! Per-endpoint circuit breaker.
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open
//! Open   --(cooldown elapsed, next attempt)--> HalfOpen (one trial)
//! HalfOpen --success--> Closed
//! HalfOpen --failure--> Open (cooldown restarted)
//! ```
//!
//! The breaker is consulted before an attempt commits any resources. While
//! open, attempts are denied without touching the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::{Clock, SystemClock};

/// Breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a trial
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cooldown growth after each failed trial (1.0 keeps it fixed)
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,

    /// Upper bound for a grown cooldown
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_cooldown_multiplier() -> f64 {
    1.0
}
fn default_max_cooldown_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn grow(&self, current: Duration) -> Duration {
        let multiplier = if self.cooldown_multiplier.is_finite() && self.cooldown_multiplier >= 1.0 {
            self.cooldown_multiplier
        } else {
            1.0
        };
        let grown = current.as_millis() as f64 * multiplier;
        let capped = grown.min(self.max_cooldown_ms.max(self.cooldown_ms) as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Answer to `before_attempt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub cooldown: Duration,
}

#[derive(Debug)]
struct EndpointBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl EndpointBreaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown,
            trial_in_flight: false,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(at) => self.cooldown.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }
}

/// Process-wide breaker registry, one state machine per endpoint key
pub struct CircuitBreakers {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    endpoints: Mutex<HashMap<String, EndpointBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointBreaker>> {
        // A panic while holding the lock cannot leave a breaker half-updated
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask whether an attempt against `endpoint` may start now
    pub fn before_attempt(&self, endpoint: &str) -> Decision {
        let now = self.clock.now();
        let base = self.config.base_cooldown();
        let mut endpoints = self.lock();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointBreaker::new(base));

        match breaker.state {
            BreakerState::Closed => Decision::Allow,
            BreakerState::Open => {
                let remaining = breaker.remaining(now);
                if remaining.is_zero() {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.trial_in_flight = true;
                    info!(endpoint, "Circuit half-open, allowing one trial");
                    Decision::Allow
                } else {
                    Decision::Deny {
                        retry_after: remaining,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if breaker.trial_in_flight {
                    Decision::Deny {
                        retry_after: breaker.cooldown,
                    }
                } else {
                    breaker.trial_in_flight = true;
                    Decision::Allow
                }
            }
        }
    }

    /// Like `before_attempt` but without claiming a half-open trial
    pub fn peek(&self, endpoint: &str) -> Decision {
        let now = self.clock.now();
        let endpoints = self.lock();
        match endpoints.get(endpoint) {
            None => Decision::Allow,
            Some(b) => match b.state {
                BreakerState::Closed => Decision::Allow,
                BreakerState::Open => {
                    let remaining = b.remaining(now);
                    if remaining.is_zero() {
                        Decision::Allow
                    } else {
                        Decision::Deny {
                            retry_after: remaining,
                        }
                    }
                }
                BreakerState::HalfOpen if b.trial_in_flight => Decision::Deny {
                    retry_after: b.cooldown,
                },
                BreakerState::HalfOpen => Decision::Allow,
            },
        }
    }

    /// Report the outcome of an allowed attempt
    pub fn record_result(&self, endpoint: &str, success: bool) {
        let now = self.clock.now();
        let base = self.config.base_cooldown();
        let mut endpoints = self.lock();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointBreaker::new(base));

        match (breaker.state, success) {
            (BreakerState::Closed, true) => {
                breaker.consecutive_failures = 0;
            }
            (BreakerState::Closed, false) => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    breaker.cooldown = base;
                    warn!(
                        endpoint,
                        failures = breaker.consecutive_failures,
                        cooldown_ms = base.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            (BreakerState::HalfOpen, true) => {
                breaker.state = BreakerState::Closed;
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
                breaker.cooldown = base;
                breaker.trial_in_flight = false;
                info!(endpoint, "Circuit closed after successful trial");
            }
            (BreakerState::HalfOpen, false) => {
                breaker.state = BreakerState::Open;
                breaker.consecutive_failures += 1;
                breaker.opened_at = Some(now);
                breaker.cooldown = self.config.grow(breaker.cooldown);
                breaker.trial_in_flight = false;
                warn!(
                    endpoint,
                    cooldown_ms = breaker.cooldown.as_millis() as u64,
                    "Trial failed, circuit re-opened"
                );
            }
            // Late results from attempts that started before the breaker opened
            (BreakerState::Open, _) => {}
        }
    }

    /// Give back a half-open trial that ended without a verdict (cancelled)
    pub fn release_trial(&self, endpoint: &str) {
        let mut endpoints = self.lock();
        if let Some(breaker) = endpoints.get_mut(endpoint) {
            if breaker.state == BreakerState::HalfOpen {
                breaker.trial_in_flight = false;
            }
        }
    }

    pub fn snapshot(&self, endpoint: &str) -> BreakerSnapshot {
        let endpoints = self.lock();
        match endpoints.get(endpoint) {
            Some(b) => BreakerSnapshot {
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                opened_at: b.opened_at,
                cooldown: b.cooldown,
            },
            None => BreakerSnapshot {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: self.config.base_cooldown(),
            },
        }
    }
}
