//! Per-upstream circuit breaker.
//!
//! Tracks consecutive failures rather than a sliding failure rate: one
//! breaker entry per upstream name, transitioning Closed -> Open -> HalfOpen
//! -> Closed (or back to Open on a half-open failure).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Observable state of one breaker, independent of wall-clock bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for one breaker. Defaults match the platform's long-standing
/// operational thresholds.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
    pub max_failure_cycles: u32,
    pub auto_disable_enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            max_failure_cycles: 3,
            auto_disable_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    failure_cycles: u32,
    half_open_calls: u32,
    last_failure_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_cycles: 0,
            half_open_calls: 0,
            last_failure_at: None,
        }
    }
}

/// Receives notifications of breaker state transitions, for forwarding onto
/// the event fabric. `gateway-orchestrator` has no dependency on
/// `gateway-events`; callers wire a concrete sink in at construction.
pub trait BreakerObserver: Send + Sync {
    fn on_state_change(&self, upstream: &str, old: CircuitState, new: CircuitState);
    fn on_auto_disable(&self, upstream: &str, failure_cycles: u32);
}

/// A no-op observer, used when the caller doesn't care about transitions.
pub struct NullObserver;

impl BreakerObserver for NullObserver {
    fn on_state_change(&self, _upstream: &str, _old: CircuitState, _new: CircuitState) {}
    fn on_auto_disable(&self, _upstream: &str, _failure_cycles: u32) {}
}

/// Per-upstream circuit breaker registry.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    entries: RwLock<HashMap<String, BreakerEntry>>,
    observer: Arc<dyn BreakerObserver>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, observer: Arc<dyn BreakerObserver>) -> Self {
        Self { config, entries: RwLock::new(HashMap::new()), observer }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default(), Arc::new(NullObserver))
    }

    /// True when calls to `upstream` should currently be skipped. Handles
    /// the Open -> HalfOpen transition as a side effect once the cooldown
    /// has elapsed, and enforces the half-open call budget.
    pub fn is_open(&self, upstream: &str) -> bool {
        let mut entries = self.entries.write().expect("circuit breaker lock poisoned");
        let entry = entries.entry(upstream.to_string()).or_default();

        if entry.state == CircuitState::Open {
            let elapsed = entry.last_failure_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
            if elapsed >= self.config.timeout {
                let old = entry.state;
                entry.state = CircuitState::HalfOpen;
                entry.half_open_calls = 0;
                debug!(upstream, "circuit breaker entering half-open");
                self.observer.on_state_change(upstream, old, entry.state);
            }
        }

        match entry.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => {
                if entry.half_open_calls >= self.config.half_open_max_calls {
                    true
                } else {
                    entry.half_open_calls += 1;
                    false
                }
            }
        }
    }

    /// Record a successful call: always closes the circuit and zeroes every
    /// counter, including `failure_cycles`.
    pub fn record_success(&self, upstream: &str) {
        let mut entries = self.entries.write().expect("circuit breaker lock poisoned");
        let entry = entries.entry(upstream.to_string()).or_default();
        let old = entry.state;
        *entry = BreakerEntry::default();
        if old != CircuitState::Closed {
            info!(upstream, "circuit breaker closed after successful call");
            self.observer.on_state_change(upstream, old, CircuitState::Closed);
        }
    }

    /// Record a failed call. A failure observed while half-open reopens the
    /// circuit and counts as one complete failure cycle; a failure observed
    /// while closed increments the failure count and opens the circuit once
    /// the threshold is reached.
    pub fn record_failure(&self, upstream: &str) {
        let should_auto_disable = {
            let mut entries = self.entries.write().expect("circuit breaker lock poisoned");
            let entry = entries.entry(upstream.to_string()).or_default();
            entry.last_failure_at = Some(Instant::now());

            match entry.state {
                CircuitState::HalfOpen => {
                    let old = entry.state;
                    entry.state = CircuitState::Open;
                    entry.failure_cycles += 1;
                    entry.half_open_calls = 0;
                    warn!(upstream, failure_cycles = entry.failure_cycles, "half-open probe failed, reopening");
                    self.observer.on_state_change(upstream, old, entry.state);
                }
                CircuitState::Closed => {
                    entry.failure_count += 1;
                    if entry.failure_count >= self.config.failure_threshold {
                        let old = entry.state;
                        entry.state = CircuitState::Open;
                        entry.failure_cycles += 1;
                        warn!(upstream, failure_cycles = entry.failure_cycles, "circuit breaker opened");
                        self.observer.on_state_change(upstream, old, entry.state);
                    }
                }
                CircuitState::Open => {}
            }

            self.config.auto_disable_enabled && entry.failure_cycles >= self.config.max_failure_cycles
        };

        if should_auto_disable {
            let cycles = self.failure_cycles(upstream);
            self.observer.on_auto_disable(upstream, cycles);
        }
    }

    #[must_use]
    pub fn state(&self, upstream: &str) -> CircuitState {
        self.entries.read().expect("circuit breaker lock poisoned").get(upstream).map_or(CircuitState::Closed, |e| e.state)
    }

    #[must_use]
    pub fn failure_cycles(&self, upstream: &str) -> u32 {
        self.entries.read().expect("circuit breaker lock poisoned").get(upstream).map_or(0, |e| e.failure_cycles)
    }

    /// Seconds remaining until an open circuit transitions to half-open.
    #[must_use]
    pub fn retry_after(&self, upstream: &str) -> Option<u64> {
        let entries = self.entries.read().expect("circuit breaker lock poisoned");
        let entry = entries.get(upstream)?;
        if entry.state != CircuitState::Open {
            return None;
        }
        let elapsed = entry.last_failure_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        Some(self.config.timeout.saturating_sub(elapsed).as_secs())
    }

    #[must_use]
    pub fn should_auto_disable(&self, upstream: &str) -> bool {
        self.config.auto_disable_enabled && self.failure_cycles(upstream) >= self.config.max_failure_cycles
    }

    /// Force-close a breaker and zero all counters, e.g. after an operator
    /// re-enables a previously auto-disabled upstream.
    pub fn reset(&self, upstream: &str) {
        let mut entries = self.entries.write().expect("circuit breaker lock poisoned");
        entries.insert(upstream.to_string(), BreakerEntry::default());
    }
}
