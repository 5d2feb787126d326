//! Circuit breaker state machine.
//!
//! CLOSED passes calls through and counts consecutive failures; at the
//! failure threshold it trips to OPEN. OPEN rejects calls without invoking
//! the upstream until the open timeout elapses, at which point the first
//! caller moves it to HALF_OPEN. HALF_OPEN closes after enough consecutive
//! successes and reopens (with a fresh timeout) on any failure.
//!
//! Transitions are driven purely by call outcomes reported through
//! [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`].

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;

// ============================================================================
// State
// ============================================================================

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

// ============================================================================
// Errors
// ============================================================================

/// Rejection issued while the breaker is open. The wrapped operation was
/// never invoked.
#[derive(Debug, Error)]
#[error("circuit open for provider {provider}, retry in {retry_in:?}")]
pub struct CircuitOpen {
    pub provider: String,
    pub retry_in: Duration,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time breaker view for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: BreakerState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub success_count: u32,
    /// How long the breaker has been open, if it is.
    pub open_for_ms: Option<u64>,
}

// ============================================================================
// CircuitBreaker
// ============================================================================

/// One breaker per upstream provider.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(provider: &str, config: BreakerConfig) -> Self {
        Self {
            provider: provider.to_string(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Ask permission to attempt a call.
    ///
    /// While OPEN, fails fast until the open timeout has elapsed; the first
    /// permitted call after the timeout moves the breaker to HALF_OPEN.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            State::Closed { .. } | State::HalfOpen { .. } => Ok(()),
            State::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.open_timeout() {
                    info!(provider = %self.provider, "Circuit half-open, allowing trial call");
                    *state = State::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        provider: self.provider.clone(),
                        retry_in: self.config.open_timeout() - elapsed,
                    })
                }
            }
        }
    }

    /// Report a successful call outcome.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    info!(provider = %self.provider, "Circuit closed after successful trials");
                    *state = State::Closed { failures: 0 };
                }
            }
            // A success from a call that started before the breaker opened;
            // the open timeout decides when to probe again.
            State::Open { .. } => {}
        }
    }

    /// Report a failed call outcome.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        failures,
                        "Circuit opened after consecutive failures"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(provider = %self.provider, "Trial call failed, circuit reopened");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (visible, failure_count, success_count, open_for_ms) = match &*state {
            State::Closed { failures } => (BreakerState::Closed, *failures, 0, None),
            State::Open { since } => (
                BreakerState::Open,
                0,
                0,
                Some(since.elapsed().as_millis() as u64),
            ),
            State::HalfOpen { successes } => (BreakerState::HalfOpen, 0, *successes, None),
        };
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: visible,
            failure_count,
            success_count,
            open_for_ms,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
