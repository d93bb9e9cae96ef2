//! Circuit breaker state machine for agent calls.
//!
//! One breaker exists per agent identity and is shared by every request
//! calling that agent. It is independent of any individual connection.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{CircuitBreakerConfig, CircuitBreakerState};

/// Callback invoked on every state transition with `(name, from, to)`.
pub type TransitionListener =
    Arc<dyn Fn(&str, CircuitBreakerState, CircuitBreakerState) + Send + Sync>;

/// Internal state, carrying the data each state needs.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { trials: u32, successes: u32 },
}

impl Phase {
    fn state(&self) -> CircuitBreakerState {
        match self {
            Phase::Closed { .. } => CircuitBreakerState::Closed,
            Phase::Open { .. } => CircuitBreakerState::Open,
            Phase::HalfOpen { .. } => CircuitBreakerState::HalfOpen,
        }
    }
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; call proceeds normally
    Allowed,
    /// Breaker half-open; call proceeds as one of the bounded trials
    Trial,
    /// Breaker open (or trial slots exhausted); no call may be attempted
    Rejected,
}

impl Admission {
    pub fn is_permitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Point-in-time view of a breaker for stats and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub half_open_trials: u32,
    pub half_open_successes: u32,
}

/// Per-agent circuit breaker.
///
/// - **Closed**: counts consecutive failures; reaching `failure_threshold`
///   opens the breaker.
/// - **Open**: every admission is rejected until `open_timeout` elapses, at
///   which point the next admission moves the breaker to half-open.
/// - **HalfOpen**: at most `half_open_max_requests` trials run concurrently;
///   `success_threshold` consecutive successes close the breaker, any
///   failure reopens it.
///
/// `Closed` never moves directly to `HalfOpen`.
///
/// ```ignore
/// let breaker = CircuitBreaker::with_name(CircuitBreakerConfig::default(), "waf");
/// match breaker.try_acquire() {
///     Admission::Rejected => { /* fast-fail without touching the network */ }
///     _ => match call().await {
///         Ok(_) => breaker.record_success(),
///         Err(_) => breaker.record_failure(),
///     },
/// }
/// ```
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
    name: Option<String>,
    listener: Option<TransitionListener>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
            name: None,
            listener: None,
        }
    }

    /// Create a new circuit breaker with a name for logging
    pub fn with_name(config: CircuitBreakerConfig, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(config)
        }
    }

    /// Attach a transition listener (metrics export).
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    /// Ask whether a call may be attempted.
    ///
    /// Performs the lazy `Open -> HalfOpen` transition once the open timeout
    /// has elapsed. A `Trial` admission must be settled with
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release_trial`](Self::release_trial).
    pub fn try_acquire(&self) -> Admission {
        let mut phase = self.phase.lock();
        let current = *phase;
        match current {
            Phase::Closed { .. } => Admission::Allowed,
            Phase::Open { opened_at } if opened_at.elapsed() >= self.config.open_timeout() => {
                *phase = Phase::HalfOpen {
                    trials: 1,
                    successes: 0,
                };
                drop(phase);
                self.notify(CircuitBreakerState::Open, CircuitBreakerState::HalfOpen);
                Admission::Trial
            }
            Phase::Open { .. } => Admission::Rejected,
            Phase::HalfOpen { trials, successes } => {
                if trials < self.config.half_open_max_requests {
                    *phase = Phase::HalfOpen {
                        trials: trials + 1,
                        successes,
                    };
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut phase = self.phase.lock();
        let current = *phase;
        match current {
            Phase::Closed { .. } => *phase = Phase::Closed { failures: 0 },
            Phase::HalfOpen { trials, successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    *phase = Phase::Closed { failures: 0 };
                    drop(phase);
                    self.notify(CircuitBreakerState::HalfOpen, CircuitBreakerState::Closed);
                } else {
                    *phase = Phase::HalfOpen {
                        trials: trials.saturating_sub(1),
                        successes,
                    };
                }
            }
            // A call admitted before the breaker opened finished late
            Phase::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut phase = self.phase.lock();
        let current = *phase;
        let from = match current {
            Phase::Closed { failures } => {
                let failures = failures + 1;
                if failures < self.config.failure_threshold {
                    *phase = Phase::Closed { failures };
                    return;
                }
                debug!(name = self.name(), failures, "Failure threshold reached");
                CircuitBreakerState::Closed
            }
            Phase::HalfOpen { .. } => CircuitBreakerState::HalfOpen,
            Phase::Open { .. } => return,
        };
        *phase = Phase::Open {
            opened_at: Instant::now(),
        };
        drop(phase);
        self.notify(from, CircuitBreakerState::Open);
    }

    /// Give back a trial slot without counting the call either way.
    ///
    /// Used for calls cancelled by the proxy itself.
    pub fn release_trial(&self) {
        let mut phase = self.phase.lock();
        if let Phase::HalfOpen { trials, successes } = *phase {
            *phase = Phase::HalfOpen {
                trials: trials.saturating_sub(1),
                successes,
            };
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitBreakerState {
        self.phase.lock().state()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let phase = *self.phase.lock();
        let (consecutive_failures, half_open_trials, half_open_successes) = match phase {
            Phase::Closed { failures } => (failures, 0, 0),
            Phase::Open { .. } => (0, 0, 0),
            Phase::HalfOpen { trials, successes } => (0, trials, successes),
        };
        BreakerSnapshot {
            state: phase.state(),
            consecutive_failures,
            half_open_trials,
            half_open_successes,
        }
    }

    /// Consecutive failures counted while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.snapshot().consecutive_failures
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let from = {
            let mut phase = self.phase.lock();
            let from = phase.state();
            *phase = Phase::Closed { failures: 0 };
            from
        };
        info!(name = self.name(), "Circuit breaker reset");
        if from != CircuitBreakerState::Closed {
            self.notify(from, CircuitBreakerState::Closed);
        }
    }

    fn notify(&self, from: CircuitBreakerState, to: CircuitBreakerState) {
        match to {
            CircuitBreakerState::Open => {
                warn!(name = self.name(), from = %from, "Circuit breaker opened")
            }
            CircuitBreakerState::HalfOpen => {
                info!(name = self.name(), "Circuit breaker half-open")
            }
            CircuitBreakerState::Closed => info!(name = self.name(), "Circuit breaker closed"),
        }
        if let Some(listener) = &self.listener {
            listener(self.name(), from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_ms: 20,
            half_open_max_requests: 1,
        }
    }

    fn open(cb: &CircuitBreaker) {
        for _ in 0..cb.config().failure_threshold {
            assert!(cb.try_acquire().is_permitted());
            cb.record_failure();
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new(test_config());
        assert_eq!(cb.try_acquire(), Admission::Allowed);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_rejects_until_open_timeout_then_single_trial() {
        let cb = CircuitBreaker::new(test_config());
        open(&cb);

        assert_eq!(cb.try_acquire(), Admission::Rejected);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        // Only one trial in flight at a time
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_closes_after_success_threshold_in_half_open() {
        let cb = CircuitBreaker::new(test_config());
        open(&cb);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.record_success();
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.record_success();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn test_failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new(test_config());
        open(&cb);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.record_success();
        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.record_failure();

        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_released_trial_frees_slot_without_counting() {
        let cb = CircuitBreaker::new(test_config());
        open(&cb);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.release_trial();
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitBreakerState::HalfOpen);
        assert_eq!(snap.half_open_trials, 0);
        assert_eq!(snap.half_open_successes, 0);
        assert_eq!(cb.try_acquire(), Admission::Trial);
    }

    #[test]
    fn test_listener_sees_every_transition() {
        let transitions = Arc::new(AtomicUsize::new(0));
        let seen = transitions.clone();
        let cb = CircuitBreaker::with_name(test_config(), "waf").with_listener(Arc::new(
            move |name, _, _| {
                assert_eq!(name, "waf");
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));

        open(&cb);
        std::thread::sleep(Duration::from_millis(30));
        cb.try_acquire();
        cb.record_success();
        cb.try_acquire();
        cb.record_success();

        // closed->open, open->half_open, half_open->closed
        assert_eq!(transitions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new(test_config());
        open(&cb);
        cb.reset();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }
}
