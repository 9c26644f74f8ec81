//! Per-provider three-state circuit breaker.
//!
//! Closed → Open on the configured number of breaker-counted failures;
//! Open → Half-Open once the open interval elapses; Half-Open admits a
//! bounded number of probes, any success closing the circuit and any
//! counted failure re-opening it.  Permanent failures propagate to the
//! caller without touching the counter.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ErrorClass;

// ─── Config ──────────────────────────────────────────────────────────────────

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive counted failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
    /// Maximum concurrent probes while half-open (≥ 1).
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { in_flight: u32 },
}

/// Decision returned by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call freely.
    Yes,
    /// Half-open; the caller holds one probe slot.
    Probe,
    /// Short-circuited (open, or half-open at capacity).
    No,
}

// ─── CircuitBreaker ──────────────────────────────────────────────────────────

/// Breaker guarding one provider.  All state updates are atomic under an
/// internal mutex; no await happens while it is held.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Current state for observability (does not mutate).
    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask to execute a call now.
    ///
    /// The first admission after `open_duration` elapses moves the breaker
    /// to half-open and counts as a probe.
    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    fn admit_at(&self, now: Instant) -> Admission {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Admission::Yes,
            Inner::Open { until } => {
                if now >= until {
                    *inner = Inner::HalfOpen { in_flight: 1 };
                    Admission::Probe
                } else {
                    Admission::No
                }
            }
            Inner::HalfOpen { in_flight } => {
                if in_flight < self.config.half_open_max {
                    *inner = Inner::HalfOpen {
                        in_flight: in_flight + 1,
                    };
                    Admission::Probe
                } else {
                    Admission::No
                }
            }
        }
    }

    /// Record a successful call.  A half-open success closes the circuit.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => {
                *inner = Inner::Closed { failures: 0 };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed call with its classification.
    ///
    /// Failures that do not count toward the breaker (permanent errors)
    /// still release a probe slot so half-open capacity is not leaked.
    pub fn record_failure(&self, class: ErrorClass) {
        self.record_failure_at(class, Instant::now());
    }

    fn record_failure_at(&self, class: ErrorClass, now: Instant) {
        let mut inner = self.lock();
        if !class.trips_breaker() {
            if let Inner::HalfOpen { in_flight } = *inner {
                *inner = Inner::HalfOpen {
                    in_flight: in_flight.saturating_sub(1),
                };
            }
            return;
        }
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    *inner = Inner::Open {
                        until: now + self.config.open_duration,
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen { .. } => {
                // A failed probe restarts the open timer.
                *inner = Inner::Open {
                    until: now + self.config.open_duration,
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Force the circuit open (used by tests and operator overrides).
    pub fn trip(&self) {
        *self.lock() = Inner::Open {
            until: Instant::now() + self.config.open_duration,
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
