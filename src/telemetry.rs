//! Telemetry events emitted by guards and the coordinator, plus the
//! non-blocking sink trait that consumes them and the per-provider latency
//! tracker used to compute health-snapshot quantiles.
//!
//! Concrete exporters (JSONL, Prometheus, etc.) are external collaborators;
//! only the trait and an in-memory reference sink live here.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Events emitted by a [`crate::guard::ProviderGuard`].
#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    CacheHit { key: String },
    CacheMiss { key: String },
    RateLimitAdmitted,
    RateLimitDenied { retry_after: Duration },
    CircuitOpened { failure_count: usize },
    CircuitHalfOpen,
    CircuitClosed,
    RetryAttempt { attempt: usize, delay: Duration },
    RetryExhausted { attempts: usize },
    RequestSucceeded { duration: Duration, cache_hit: bool },
    RequestFailed { duration: Duration, retryable: bool },
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheHit { key } => write!(f, "cache-hit({key})"),
            Self::CacheMiss { key } => write!(f, "cache-miss({key})"),
            Self::RateLimitAdmitted => write!(f, "rate-limit-admitted"),
            Self::RateLimitDenied { retry_after } => write!(f, "rate-limit-denied(retry_after={retry_after:?})"),
            Self::CircuitOpened { failure_count } => write!(f, "circuit-opened(failures={failure_count})"),
            Self::CircuitHalfOpen => write!(f, "circuit-half-open"),
            Self::CircuitClosed => write!(f, "circuit-closed"),
            Self::RetryAttempt { attempt, delay } => write!(f, "retry-attempt(#{attempt}, delay={delay:?})"),
            Self::RetryExhausted { attempts } => write!(f, "retry-exhausted(attempts={attempts})"),
            Self::RequestSucceeded { duration, cache_hit } => {
                write!(f, "request-succeeded(duration={duration:?}, cache_hit={cache_hit})")
            }
            Self::RequestFailed { duration, retryable } => {
                write!(f, "request-failed(duration={duration:?}, retryable={retryable})")
            }
        }
    }
}

/// Events emitted by a [`crate::coordinator::MultiProviderCoordinator`].
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    ForcedOpen { provider: String, remaining_fraction: f64 },
    FallbackUsed { from: String, to: String, reason: String },
    FallbackExhausted { provider: String },
    BudgetWarning { provider: String, remaining_fraction: f64 },
}

impl fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForcedOpen { provider, remaining_fraction } => {
                write!(f, "forced-open({provider}, remaining={remaining_fraction:.3})")
            }
            Self::FallbackUsed { from, to, reason } => write!(f, "fallback-used({from} -> {to}: {reason})"),
            Self::FallbackExhausted { provider } => write!(f, "fallback-exhausted({provider})"),
            Self::BudgetWarning { provider, remaining_fraction } => {
                write!(f, "budget-warning({provider}, remaining={remaining_fraction:.3})")
            }
        }
    }
}

/// Non-blocking telemetry consumer. Implementations must not perform I/O
/// on the hot path — drop events under backpressure rather than block.
pub trait TelemetrySink: Send + Sync {
    fn emit_guard_event(&self, provider: &str, event: GuardEvent);
    fn emit_coordinator_event(&self, event: CoordinatorEvent) {
        let _ = event;
    }
}

/// Fire-and-forget emission; swallows the call entirely if no sink is configured.
pub fn emit_best_effort(sink: Option<&dyn TelemetrySink>, provider: &str, event: GuardEvent) {
    if let Some(sink) = sink {
        sink.emit_guard_event(provider, event);
    }
}

const MAX_RECORDED_EVENTS: usize = 2048;

/// Reference sink used by tests and by the coordinator's own rollups: an
/// in-memory ring buffer of the most recent events.
#[derive(Default)]
pub struct InMemorySink {
    guard_events: Mutex<Vec<(String, GuardEvent)>>,
    coordinator_events: Mutex<Vec<CoordinatorEvent>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard_events(&self) -> Vec<(String, GuardEvent)> {
        self.guard_events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn coordinator_events(&self) -> Vec<CoordinatorEvent> {
        self.coordinator_events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl TelemetrySink for InMemorySink {
    fn emit_guard_event(&self, provider: &str, event: GuardEvent) {
        let mut events = self.guard_events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= MAX_RECORDED_EVENTS {
            events.remove(0);
        }
        events.push((provider.to_string(), event));
    }

    fn emit_coordinator_event(&self, event: CoordinatorEvent) {
        let mut events = self.coordinator_events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= MAX_RECORDED_EVENTS {
            events.remove(0);
        }
        events.push(event);
    }
}

/// Retains the last `capacity` latency observations for a provider.
/// Writes take a mutex; reads copy-then-sort so the O(N log N) quantile
/// computation never holds the lock.
pub struct LatencyTracker {
    capacity: usize,
    samples: Mutex<Vec<Duration>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyQuantiles {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
    pub avg: Duration,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), samples: Mutex::new(Vec::new()) }
    }

    pub fn record(&self, duration: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() >= self.capacity {
            samples.remove(0);
        }
        samples.push(duration);
    }

    pub fn quantiles(&self) -> LatencyQuantiles {
        let mut sorted = self.samples.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if sorted.is_empty() {
            return LatencyQuantiles::default();
        }
        sorted.sort_unstable();

        let pick = |fraction: f64| -> Duration {
            let idx = ((sorted.len() as f64 - 1.0) * fraction).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        let total: Duration = sorted.iter().sum();
        let avg = total / sorted.len() as u32;

        LatencyQuantiles { p50: pick(0.50), p95: pick(0.95), p99: pick(0.99), max: *sorted.last().unwrap(), avg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_records_guard_events() {
        let sink = InMemorySink::new();
        emit_best_effort(Some(&sink), "binance", GuardEvent::CacheHit { key: "k".into() });
        emit_best_effort(None, "binance", GuardEvent::CacheMiss { key: "k".into() });
        let events = sink.guard_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "binance");
    }

    #[test]
    fn latency_tracker_computes_quantiles_from_sorted_samples() {
        let tracker = LatencyTracker::new(1000);
        for ms in 1..=100 {
            tracker.record(Duration::from_millis(ms));
        }
        let q = tracker.quantiles();
        assert_eq!(q.max, Duration::from_millis(100));
        assert!(q.p50 <= q.p95);
        assert!(q.p95 <= q.p99);
        assert!(q.p99 <= q.max);
    }

    #[test]
    fn latency_tracker_caps_at_capacity() {
        let tracker = LatencyTracker::new(3);
        for ms in 1..=5 {
            tracker.record(Duration::from_millis(ms));
        }
        let q = tracker.quantiles();
        // Oldest samples (1ms, 2ms) should have been evicted.
        assert_eq!(q.max, Duration::from_millis(5));
    }

    #[test]
    fn empty_tracker_returns_zero_quantiles() {
        let tracker = LatencyTracker::new(10);
        assert_eq!(tracker.quantiles(), LatencyQuantiles::default());
    }
}
