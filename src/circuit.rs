//! Sliding-window circuit breaker with lock-free state transitions.

use crate::clock::{Clock, MonotonicClock};
use crate::errors::GuardError;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Hard ceiling on the open-timeout backoff (§4.2: "doubles … up to a 5-minute cap").
pub const MAX_OPEN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that force an open regardless of window fill.
    pub failure_threshold: usize,
    /// Size of the sliding outcome window (W).
    pub window_size: usize,
    /// Failure-rate fraction (θ) that opens the circuit once `min_samples` is met.
    pub fraction_threshold: f64,
    /// Minimum requests observed in the window before the fraction rule applies.
    pub min_samples: usize,
    /// Base open-timeout; doubles after each consecutive open, capped at `MAX_OPEN_TIMEOUT`.
    pub open_timeout: Duration,
    /// Consecutive half-open successes required to close the circuit.
    pub half_open_success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_size: 20,
            fraction_threshold: 0.5,
            min_samples: 10,
            open_timeout: Duration::from_secs(30),
            half_open_success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            window_size: 1,
            fraction_threshold: 1.1,
            min_samples: usize::MAX,
            open_timeout: Duration::from_secs(0),
            half_open_success_threshold: 1,
        }
    }
}

struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1) }
    }

    fn push(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn is_full(&self) -> bool {
        self.outcomes.len() >= self.capacity
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }
}

struct Inner {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_half_open_successes: AtomicUsize,
    consecutive_opens: AtomicUsize,
    opened_at_millis: AtomicU64,
    window: Mutex<Window>,
    last_success_wall_millis: AtomicI64,
    last_failure_wall_millis: AtomicI64,
}

/// Per-provider circuit breaker. `check` is the admission gate; `record_success`
/// and `record_failure` feed the sliding window after each attempt.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                consecutive_half_open_successes: AtomicUsize::new(0),
                consecutive_opens: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                window: Mutex::new(Window::new(config.window_size)),
                last_success_wall_millis: AtomicI64::new(0),
                last_failure_wall_millis: AtomicI64::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Step 1 of `ProviderGuard::execute`: admission check. Transitions
    /// open → half-open exactly once the probe window has elapsed.
    pub fn check(&self) -> Result<(), GuardError> {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.inner.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    let timeout = self.current_open_timeout().as_millis() as u64;

                    if elapsed < timeout {
                        return Err(GuardError::CircuitOpen {
                            failure_count: self.inner.consecutive_failures.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }

                    match self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.inner.consecutive_half_open_successes.store(0, Ordering::Release);
                            tracing::info!("circuit breaker: open -> half-open");
                            return Ok(());
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => return Ok(()),
                _ => return Ok(()),
            }
        }
    }

    /// Wall-clock timestamp of the most recent recorded success, if any.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        stamp_to_datetime(self.inner.last_success_wall_millis.load(Ordering::Acquire))
    }

    /// Wall-clock timestamp of the most recent recorded failure, if any.
    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        stamp_to_datetime(self.inner.last_failure_wall_millis.load(Ordering::Acquire))
    }

    pub fn record_success(&self) {
        self.inner.last_success_wall_millis.store(Utc::now().timestamp_millis(), Ordering::Release);
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes =
                    self.inner.consecutive_half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_success_threshold {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.inner.consecutive_failures.store(0, Ordering::Release);
                        self.inner.consecutive_opens.store(0, Ordering::Release);
                        self.inner.window.lock().unwrap_or_else(|p| p.into_inner()).outcomes.clear();
                        tracing::info!("circuit breaker: half-open -> closed");
                    }
                }
            }
            _ => {
                self.inner.consecutive_failures.store(0, Ordering::Release);
                let mut window = self.inner.window.lock().unwrap_or_else(|p| p.into_inner());
                window.push(true);
            }
        }
    }

    pub fn record_failure(&self) {
        self.inner.last_failure_wall_millis.store(Utc::now().timestamp_millis(), Ordering::Release);
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.open_now();
                    tracing::warn!("circuit breaker: half-open probe failed -> open");
                }
            }
            STATE_CLOSED => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                let (rate, samples, full) = {
                    let mut window = self.inner.window.lock().unwrap_or_else(|p| p.into_inner());
                    window.push(false);
                    (window.failure_rate(), window.len(), window.is_full())
                };

                let should_open = failures >= self.config.failure_threshold
                    || (full && samples >= self.config.min_samples && rate >= self.config.fraction_threshold);

                if should_open
                    && self
                        .inner
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.open_now();
                    tracing::error!(failures, rate, "circuit breaker: closed -> open");
                }
            }
            _ => {}
        }
    }

    fn open_now(&self) {
        self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
        self.inner.consecutive_opens.fetch_add(1, Ordering::AcqRel);
    }

    /// Forces the circuit open regardless of current state, bypassing the
    /// normal failure-counting rules. Used by the coordinator's budget
    /// monitor to stop a provider that has exhausted its quota.
    pub fn force_open(&self) {
        self.inner.state.store(STATE_OPEN, Ordering::Release);
        self.open_now();
        tracing::warn!("circuit breaker: forced open");
    }

    fn current_open_timeout(&self) -> Duration {
        let opens = self.inner.consecutive_opens.load(Ordering::Acquire) as u32;
        let doublings = opens.saturating_sub(1);
        let doubled = self.config.open_timeout.checked_mul(1u32.checked_shl(doublings.min(31)).unwrap_or(u32::MAX));
        doubled.unwrap_or(MAX_OPEN_TIMEOUT).min(MAX_OPEN_TIMEOUT)
    }
}

fn stamp_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock as ClockTrait;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl ClockTrait for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn starts_closed_and_admits() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn consecutive_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().unwrap_err().is_circuit_open());
    }

    #[test]
    fn fraction_threshold_opens_once_window_full_and_min_samples_met() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: usize::MAX,
            window_size: 4,
            fraction_threshold: 0.5,
            min_samples: 4,
            ..Default::default()
        });
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_after_timeout_then_single_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .with_clock(clock.clone());

        breaker.record_failure();
        assert!(breaker.check().is_err());

        clock.advance(150);
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_success_closes_circuit() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(100),
            half_open_success_threshold: 1,
            ..Default::default()
        })
        .with_clock(clock.clone());

        breaker.record_failure();
        clock.advance(150);
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn open_timeout_doubles_after_consecutive_opens_capped_at_five_minutes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(100),
            ..Default::default()
        })
        .with_clock(clock.clone());

        // First open: timeout = 100s.
        breaker.record_failure();
        assert_eq!(breaker.current_open_timeout(), Duration::from_secs(100));

        clock.advance(100_000);
        assert!(breaker.check().is_ok()); // half-open
        breaker.record_failure(); // re-open, second consecutive open: timeout = 200s
        assert_eq!(breaker.current_open_timeout(), Duration::from_secs(200));

        // Force enough consecutive opens that doubling would exceed the cap.
        for _ in 0..10 {
            clock.advance(breaker.current_open_timeout().as_millis() as u64 + 1);
            let _ = breaker.check();
            breaker.record_failure();
        }
        assert!(breaker.current_open_timeout() <= MAX_OPEN_TIMEOUT);
    }

    #[test]
    fn success_in_closed_state_resets_consecutive_failure_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
