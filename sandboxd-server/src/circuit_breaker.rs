//! Circuit Breaker guarding a shared downstream resource
//!
//! Three states:
//! - Closed: normal operation, calls pass through
//! - Open: too many recent failures, calls are rejected
//! - HalfOpen: cool-down elapsed, calls are let through as probes
//!
//! Failures are counted inside a sliding time window and pruned lazily.
//! While half-open, every caller is admitted as a probe; the first probe
//! failure reopens the circuit.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sandboxd_utils::{Result, SandboxError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failures exceeded threshold - requests are rejected
    Open,
    /// Testing recovery - probe requests pass through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time spent open before probes are admitted
    pub recovery_timeout: Duration,
    /// Sliding window for counting failures
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the window
    pub failures: u32,
    /// Consecutive successes while half-open
    pub successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Time left before a probe is admitted (0 unless open)
    pub remaining_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    successes: u32,
    opened_at: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Circuit breaker for one downstream resource
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without triggering the open -> half-open transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call may proceed
    ///
    /// While open, the first check after `recovery_timeout` moves the
    /// breaker to half-open and admits the caller as a probe.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    info!(name = %self.name, "Circuit breaker entering half-open state");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(
                    name = %self.name,
                    successes = inner.successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success in half-open state"
                );
                if inner.successes >= self.config.success_threshold {
                    info!(name = %self.name, "Circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.successes = 0;
                    inner.opened_at = None;
                }
            }
            // Closed: the window alone decides; Open: late result from an earlier call
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.prune(now, self.config.failure_window);
                inner.failures.push_back(now);
                let failures = inner.failures.len() as u32;

                debug!(
                    name = %self.name,
                    failures = failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );

                if failures >= self.config.failure_threshold {
                    warn!(name = %self.name, failures = failures, "Circuit breaker opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    name = %self.name,
                    "Circuit breaker failure in half-open state, reopening"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` behind the breaker, recording its outcome
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.can_execute() {
            return Err(SandboxError::CircuitOpen {
                remaining_ms: self.remaining_ms(),
            });
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Time left before the open circuit admits a probe
    pub fn remaining_ms(&self) -> u64 {
        let inner = self.inner.lock();
        self.remaining_locked(&inner)
    }

    fn remaining_locked(&self, inner: &Inner) -> u64 {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => self
                .config
                .recovery_timeout
                .saturating_sub(at.elapsed())
                .as_millis() as u64,
            _ => 0,
        }
    }

    /// Snapshot for observability
    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.failure_window);
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures.len() as u32,
            successes: inner.successes,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            remaining_ms: self.remaining_locked(&inner),
        }
    }

    /// Reinitialize to a fresh closed breaker
    pub fn reset(&self) {
        info!(name = %self.name, "Circuit breaker reset");
        *self.inner.lock() = Inner::new();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
