//! Per-model circuit breaker.
//!
//! Consecutive failures per model id trip the circuit *open*; after the
//! cooldown it goes *half-open* and lets one probe through. A success
//! closes it again.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped, requests skipped until cooldown expires.
    Open,
    /// Cooldown expired, one probe allowed.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure: HashMap<String, Instant>,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure: HashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    pub fn record_success(&mut self, model: &str) {
        self.consecutive_failures.remove(model);
        self.last_failure.remove(model);
    }

    pub fn record_failure(&mut self, model: &str) {
        *self
            .consecutive_failures
            .entry(model.to_string())
            .or_insert(0) += 1;
        self.last_failure.insert(model.to_string(), Instant::now());
    }

    pub fn state(&self, model: &str) -> CircuitState {
        if self.failure_count(model) < self.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure.get(model) {
            Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Closed or half-open.
    pub fn is_available(&self, model: &str) -> bool {
        self.state(model) != CircuitState::Open
    }

    pub fn failure_count(&self, model: &str) -> u32 {
        self.consecutive_failures.get(model).copied().unwrap_or(0)
    }

    /// First model in `ladder` whose circuit is not open.
    pub fn first_available<'a>(&self, ladder: &[&'a str]) -> Option<&'a str> {
        ladder.iter().copied().find(|m| self.is_available(m))
    }
}

impl Default for CircuitBreaker {
    /// Three strikes, sixty second cooldown.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
