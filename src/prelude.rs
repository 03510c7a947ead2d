//! Convenient re-exports for common `marketdata-substrate` types.
pub use crate::{
    bridge::{RequestKind, TieredBridge},
    budget::{BudgetConfig, BudgetState},
    cache::{Cache, CacheEntry},
    circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    coordinator::{HealthReport, MultiProviderCoordinator, OverallStatus},
    envelope::{Envelope, PayloadKind, Tier},
    errors::{AllTiersFailed, GuardError, StalenessError, ValidationError},
    guard::{Fetcher, GuardConfig, ProviderGuard, Request, Response},
    telemetry::{GuardEvent, InMemorySink, TelemetrySink},
    tier::{TierHandle, TierName},
    validation::{SchemaValidator, StalenessChecker},
    Backoff, Jitter,
};
