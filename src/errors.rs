//! Error types for the acquisition substrate.
//!
//! `GuardError` is hand-rolled (`Display` + `std::error::Error`, no
//! `thiserror`) for the hot-path guard/bridge errors, the same texture the
//! teacher reserves for its own per-call error enum. Lower-frequency glue
//! errors (validation, staleness) use `thiserror`.

use std::fmt;
use std::time::Duration;

/// Errors a [`crate::guard::ProviderGuard`] can return from `execute`.
///
/// Retries are internal to the guard: a caller never observes a transient
/// failure that was itself retried, only the final outcome.
#[derive(Debug, Clone)]
pub enum GuardError {
    /// The circuit is open and `now < next_probe`; the fetcher was never invoked.
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// The token bucket had insufficient tokens for this request.
    RateLimited { retry_after: Duration },
    /// The fetcher returned a non-2xx status after retries were exhausted
    /// (or immediately, for a non-retryable 4xx).
    Upstream { status: u16, retryable: bool, message: String },
    /// The fetcher itself failed (connection refused, DNS, timeout, …).
    Network { message: String },
    /// The caller's cancellation token fired before the operation completed.
    ContextCancelled,
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failure_count, open_duration } => write!(
                f,
                "circuit open ({failure_count} failures, open for {open_duration:?})"
            ),
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {retry_after:?}")
            }
            Self::Upstream { status, retryable, message } => {
                write!(f, "upstream error {status} (retryable={retryable}): {message}")
            }
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::ContextCancelled => write!(f, "context cancelled"),
        }
    }
}

impl std::error::Error for GuardError {}

impl GuardError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::ContextCancelled)
    }

    /// Whether this outcome should count against the circuit breaker's
    /// sliding window. Cancellation is a neutral abort, not a failure.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::ContextCancelled)
    }

    /// Whether a guard retry loop should attempt another round for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Every tier in a [`crate::bridge::TieredBridge`] cascade failed or went stale.
#[derive(Debug, Clone)]
pub struct AllTiersFailed {
    pub chain: Vec<String>,
}

impl fmt::Display for AllTiersFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all tiers failed: [{}]", self.chain.join(", "))
    }
}

impl std::error::Error for AllTiersFailed {}

/// A schema or record validation failure. Surfaced verbatim by callers —
/// it indicates a contract breach and must never be hidden or retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed: field={field} rule={rule}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub rule: String,
    pub message: String,
}

/// Direction of a staleness violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessDirection {
    Past,
    Future,
}

impl fmt::Display for StalenessDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Past => write!(f, "past"),
            Self::Future => write!(f, "future"),
        }
    }
}

/// A staleness check failure (`past-stale` or `future-stale`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record is {direction}-stale: skew={skew_ms}ms limit={limit_ms}ms")]
pub struct StalenessError {
    pub skew_ms: i64,
    pub limit_ms: i64,
    pub direction: StalenessDirection,
}
