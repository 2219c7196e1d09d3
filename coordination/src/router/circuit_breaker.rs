//! Circuit breaker and fallback ladder for model routing.
//!
//! The circuit breaker tracks consecutive failures per model name (the
//! string a [`crate::state::Position`] resolves to). When failures exceed a
//! configurable threshold the circuit *opens* and the model is temporarily
//! skipped. After a cooldown the circuit enters *half-open* state to probe
//! recovery.
//!
//! The [`FallbackLadder`] walks an ordered list of model names, skipping any
//! whose circuit is currently open.

use std::collections::HashMap;

/// Circuit breaker state for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy — requests allowed.
    Closed,
    /// Tripped — requests blocked until cooldown expires.
    Open,
    /// Cooldown expired — one probe request allowed.
    HalfOpen,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-model circuit breaker tracking consecutive failures.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure_secs: HashMap<String, u64>,
    /// Consecutive 429 rate-limit hits per model (for exponential backoff).
    rate_limit_hits: HashMap<String, u32>,
    /// Unix timestamp when rate-limit cooldown expires per model.
    rate_limit_until: HashMap<String, u64>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds after last failure before Open → HalfOpen.
    pub cooldown_secs: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            failure_threshold,
            cooldown_secs,
            ..Default::default()
        }
    }

    /// Record a success — resets circuit to Closed.
    pub fn record_success(&mut self, model: &str) {
        self.consecutive_failures.remove(model);
        self.last_failure_secs.remove(model);
        self.rate_limit_hits.remove(model);
        self.rate_limit_until.remove(model);
    }

    /// Record a failure — may trip circuit to Open.
    pub fn record_failure(&mut self, model: &str) {
        let count = self
            .consecutive_failures
            .entry(model.to_string())
            .or_insert(0);
        *count += 1;
        self.last_failure_secs
            .insert(model.to_string(), unix_now());
    }

    /// Record a 429 rate-limit response with adaptive exponential backoff.
    ///
    /// Cooldown doubles each consecutive hit: 2 s, 4 s, 8 s, … capped at 120 s.
    /// Also records a regular failure so the normal circuit-breaker logic applies.
    pub fn record_rate_limit(&mut self, model: &str) {
        let hits = self
            .rate_limit_hits
            .entry(model.to_string())
            .or_insert(0);
        *hits += 1;
        let cooldown = 2u64
            .saturating_mul(2u64.saturating_pow((*hits).saturating_sub(1)))
            .min(120);
        self.rate_limit_until
            .insert(model.to_string(), unix_now() + cooldown);
        self.record_failure(model);
    }

    /// Remaining rate-limit cooldown seconds for `model`, or `None` if not rate-limited.
    pub fn rate_limit_cooldown(&self, model: &str) -> Option<u64> {
        let &until = self.rate_limit_until.get(model)?;
        let now = unix_now();
        if now < until {
            Some(until - now)
        } else {
            None
        }
    }

    /// Current state of the circuit for `model`.
    pub fn state(&self, model: &str) -> CircuitState {
        if self.rate_limit_cooldown(model).is_some() {
            return CircuitState::Open;
        }
        let failures = self.consecutive_failures.get(model).copied().unwrap_or(0);
        if failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        let last = self.last_failure_secs.get(model).copied().unwrap_or(0);
        if unix_now().saturating_sub(last) >= self.cooldown_secs {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Whether the model is available (Closed or HalfOpen).
    pub fn is_available(&self, model: &str) -> bool {
        !matches!(self.state(model), CircuitState::Open)
    }

    /// Consecutive failures recorded for `model`.
    pub fn failure_count(&self, model: &str) -> u32 {
        self.consecutive_failures.get(model).copied().unwrap_or(0)
    }
}

/// Ordered fallback ladder of model names.
///
/// The first model whose circuit is not open is returned.
#[derive(Debug, Clone)]
pub struct FallbackLadder {
    models: Vec<String>,
}

impl FallbackLadder {
    /// Create a ladder from an ordered list of model names, e.g. the
    /// escalation chain for a position (primary, escalation_1, escalation_2).
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }

    /// First model in the ladder whose circuit is not open.
    pub fn next_available(&self, breaker: &CircuitBreaker) -> Option<&str> {
        self.models
            .iter()
            .map(String::as_str)
            .find(|m| breaker.is_available(m))
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }
}
