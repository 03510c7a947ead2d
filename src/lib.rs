#![forbid(unsafe_code)]

//! # marketdata-substrate
//!
//! A tiered market-data acquisition substrate: per-provider guards (cache,
//! token-bucket rate limiting, circuit breaking, retry with backoff and
//! jitter), a multi-provider coordinator with fallback and budget tracking,
//! and a hot/warm/cold read bridge that cascades by freshness and authority.
//!
//! ## Layers
//!
//! - [`envelope`] — the record type carried between every component.
//! - [`guard`] — [`guard::ProviderGuard`], wrapping one call-site with
//!   cache → rate-limit → circuit → retry.
//! - [`coordinator`] — [`coordinator::MultiProviderCoordinator`], owning a
//!   named fleet of guards plus fallback adjacency and budgets.
//! - [`bridge`] — [`bridge::TieredBridge`], cascading reads across
//!   Hot/Warm/Cold [`tier::TierHandle`]s.
//! - [`validation`] — schema conformance and staleness checks run before a
//!   record enters storage or scoring.
//!
//! ## Quick Start
//!
//! ```rust
//! use marketdata_substrate::{GuardConfig, ProviderGuard};
//!
//! let guard = ProviderGuard::new(GuardConfig { name: "binance-rest".into(), ..Default::default() });
//! assert_eq!(guard.name(), "binance-rest");
//! ```

mod backoff;
mod bridge;
mod budget;
mod cache;
mod circuit;
mod clock;
mod coordinator;
mod envelope;
mod errors;
mod guard;
mod jitter;
mod sleeper;
mod telemetry;
mod tier;
mod token_bucket;
mod validation;

pub use backoff::Backoff;
pub use bridge::{should_accept_envelope, RequestKind, TierSlot, TieredBridge};
pub use budget::{BudgetConfig, BudgetSnapshot, BudgetState};
pub use cache::{Cache, CacheEntry};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, MAX_OPEN_TIMEOUT};
pub use clock::{Clock, MonotonicClock};
pub use coordinator::{HealthReport, MultiProviderCoordinator, OverallStatus, ProviderHealth};
pub use envelope::{compute_checksum, should_accept, Envelope, EnvelopeOptions, PayloadKind, Provenance, Tier};
pub use errors::{AllTiersFailed, GuardError, StalenessDirection, StalenessError, ValidationError};
pub use guard::{Fetcher, GuardConfig, GuardCounters, ProviderGuard, Request, Response};
pub use jitter::Jitter;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    emit_best_effort, CoordinatorEvent, GuardEvent, InMemorySink, LatencyQuantiles, LatencyTracker,
    TelemetrySink,
};
pub use tier::{TierHandle, TierName};
pub use token_bucket::{Admission, TokenBucket, TokenBucketConfig};
pub use validation::{
    FieldKind, FieldSchema, NamedFormat, RecordValue, Schema, SchemaValidator, StalenessChecker,
    StalenessConfig, StalenessResult, ValidationResult,
};

pub mod prelude;
