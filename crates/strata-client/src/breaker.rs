//! Per-endpoint circuit breaker.
//!
//! Closed counts outcomes over a rolling window; once the window has seen
//! enough traffic and the failure rate crosses the threshold, the breaker
//! opens for `sleep_window`. After that exactly one probe is admitted:
//! success closes the breaker, failure re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;

/// Decides whether a completed attempt counts against the breaker.
/// Returns true when the outcome is a failure. Only applied to errored
/// attempts; responses from the server always count as successes.
pub type BreakerFailurePredicate = std::sync::Arc<dyn Fn(&ErrorKind) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Minimum attempts in the rolling window before the rate is judged.
    pub volume_threshold: u64,
    /// Failure percentage (0–100) that opens the breaker.
    pub error_threshold_percentage: f64,
    /// How long an open breaker rejects traffic before probing.
    pub sleep_window: Duration,
    /// Width of the rolling outcome window.
    pub rolling_window: Duration,
    pub failure_predicate: BreakerFailurePredicate,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_threshold: 20,
            error_threshold_percentage: 50.0,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
            failure_predicate: std::sync::Arc::new(|kind| {
                *kind != ErrorKind::KeyNotFound
            }),
        }
    }
}

impl std::fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("enabled", &self.enabled)
            .field("volume_threshold", &self.volume_threshold)
            .field("error_threshold_percentage", &self.error_threshold_percentage)
            .field("sleep_window", &self.sleep_window)
            .field("rolling_window", &self.rolling_window)
            .finish()
    }
}

#[derive(Debug)]
enum State {
    Closed {
        window_start: Instant,
        total: u64,
        failed: u64,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

/// One breaker, owned by the multiplexer per KV endpoint (and by the HTTP
/// dispatcher per HTTP endpoint).
pub(crate) struct CircuitBreaker {
    cfg: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State::Closed {
                window_start: Instant::now(),
                total: 0,
                failed: 0,
            }),
        }
    }

    /// Whether a request may pass right now. An open breaker whose sleep
    /// window has elapsed transitions to half-open and admits exactly the
    /// one caller that made it transition.
    pub fn admit(&self) -> bool {
        if !self.cfg.enabled {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if Instant::now() >= *until {
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed {
                window_start,
                total,
                failed,
            } => {
                roll(&self.cfg, window_start, total, failed);
                *total += 1;
            }
            State::HalfOpen { .. } => {
                *state = State::Closed {
                    window_start: Instant::now(),
                    total: 0,
                    failed: 0,
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed {
                window_start,
                total,
                failed,
            } => {
                roll(&self.cfg, window_start, total, failed);
                *total += 1;
                *failed += 1;
                let rate = (*failed as f64) * 100.0 / (*total as f64);
                if *total >= self.cfg.volume_threshold
                    && rate >= self.cfg.error_threshold_percentage
                {
                    *state = State::Open {
                        until: Instant::now() + self.cfg.sleep_window,
                    };
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open {
                    until: Instant::now() + self.cfg.sleep_window,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Whether the predicate classifies this error as a breaker failure.
    pub fn counts_as_failure(&self, kind: &ErrorKind) -> bool {
        (*self.cfg.failure_predicate)(kind)
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Open { .. })
    }
}

/// Reset the closed-state counters when the rolling window has lapsed.
fn roll(cfg: &BreakerConfig, window_start: &mut Instant, total: &mut u64, failed: &mut u64) {
    if window_start.elapsed() >= cfg.rolling_window {
        *window_start = Instant::now();
        *total = 0;
        *failed = 0;
    }
}
