//! # Circuit Breaker
//!
//! Failure guard in front of the OFD transport.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Circuit Breaker States                              │
//! │                                                                         │
//! │                  N consecutive failures                                 │
//! │   ┌──────────┐ ───────────────────────────► ┌──────────┐               │
//! │   │  CLOSED  │                              │   OPEN   │               │
//! │   │ (normal) │ ◄──┐                         │(fail fast)│              │
//! │   └──────────┘    │                         └────┬─────┘               │
//! │        ▲          │ M trial successes            │ recovery timeout    │
//! │        │          │                              │ elapses             │
//! │        │          │                              ▼                     │
//! │        │     ┌────┴─────┐  trial fails    ┌──────────┐                │
//! │        └─────│ HALF-OPEN│ ───────────────►│   OPEN   │ (window resets)│
//! │              │(1 at a   │                 └──────────┘                │
//! │              │ time)    │                                              │
//! │              └──────────┘                                              │
//! │                                                                         │
//! │  While OPEN every call is refused locally: no connection attempt, no   │
//! │  timeout wait, no retry consumed on the receipt.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only transport-level outcomes feed the breaker. An operator 4xx
//! rejection means the operator IS reachable, so callers classify it as
//! a success for breaker purposes even though the receipt itself failed.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

// =============================================================================
// State
// =============================================================================

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused locally until the recovery timeout elapses.
    Open,
    /// Trial calls are admitted one at a time.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of breaker internals for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Seconds until the next half-open trial, when open.
    pub retry_in_secs: Option<u64>,
}

/// What a state-feeding call caused, so callers can audit transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    /// No state change.
    None,
    /// The circuit just opened.
    Opened,
    /// The circuit just closed (enough trial calls succeeded).
    Closed,
}

/// Error wrapper returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    /// The circuit is open; the operation was never invoked.
    #[error("circuit open: next trial in {retry_in_secs}s")]
    Open { retry_in_secs: u64 },

    /// The operation ran and failed (a failure was recorded).
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// When the circuit opened (set while Open).
    opened_at: Option<Instant>,
    /// Guards the single in-flight trial slot.
    trial_in_flight: bool,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Consecutive-failure circuit breaker.
///
/// Shared across the daemon and HTTP surface via `Arc`; all state lives
/// behind one mutex and every operation is a short critical section.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// `failure_threshold` consecutive failures open the circuit for
    /// `recovery_timeout`; after that, trial calls are admitted one at a
    /// time and `success_threshold` consecutive trial successes close it.
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery_timeout: Duration) -> Self {
        CircuitBreaker {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Wraps one remote invocation.
    ///
    /// When the circuit is open the operation is never polled and
    /// [`BreakerError::Open`] comes back immediately. Otherwise the
    /// outcome is recorded and any failure is re-raised as
    /// [`BreakerError::Inner`].
    pub async fn call<T, E, F>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: Future<Output = Result<T, E>>,
    {
        if let Err(retry_in_secs) = self.check() {
            return Err(BreakerError::Open { retry_in_secs });
        }

        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Asks permission to make one call (the manual half of [`call`]).
    ///
    /// ## Returns
    /// - `Ok(())`: proceed; the caller MUST report the outcome via
    ///   [`record_success`] or [`record_failure`]
    /// - `Err(remaining_secs)`: circuit open (or a trial already in
    ///   flight), fail fast
    ///
    /// [`call`]: CircuitBreaker::call
    /// [`record_success`]: CircuitBreaker::record_success
    /// [`record_failure`]: CircuitBreaker::record_failure
    pub fn check(&self) -> Result<(), u64> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => Ok(()),

            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();

                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.trial_in_flight = true;
                    info!("Circuit half-open: admitting trial call");
                    Ok(())
                } else {
                    let remaining = self.recovery_timeout - elapsed;
                    Err(remaining.as_secs().max(1))
                }
            }

            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // Another task holds the trial slot
                    Err(1)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Reports a successful call.
    pub fn record_success(&self) -> BreakerTransition {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;

                if inner.half_open_successes >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                    info!("Circuit closed: trial calls succeeded");
                    BreakerTransition::Closed
                } else {
                    BreakerTransition::None
                }
            }

            _ => {
                inner.consecutive_failures = 0;
                BreakerTransition::None
            }
        }
    }

    /// Reports a failed call (transport-level only).
    pub fn record_failure(&self) -> BreakerTransition {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::HalfOpen => {
                // Trial failed: back to open, window restarts
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                inner.trial_in_flight = false;
                warn!(
                    recovery_secs = self.recovery_timeout.as_secs(),
                    "Circuit re-opened: trial call failed"
                );
                BreakerTransition::Opened
            }

            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        failures = inner.consecutive_failures,
                        recovery_secs = self.recovery_timeout.as_secs(),
                        "Circuit opened"
                    );
                    BreakerTransition::Opened
                } else {
                    BreakerTransition::None
                }
            }

            // Already open (a call admitted before the threshold tripped
            // came back late); the window is already running
            CircuitState::Open => BreakerTransition::None,
        }
    }

    /// Current state, without consuming a trial slot.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Diagnostic snapshot.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().expect("breaker lock poisoned");

        let retry_in_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.recovery_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_secs(),
            ),
            _ => None,
        };

        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            retry_in_secs,
        }
    }

    /// Forces the breaker back to closed (administrative intervention).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!("Circuit breaker manually reset");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
