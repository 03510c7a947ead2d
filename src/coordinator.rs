//! Owns a named set of [`ProviderGuard`]s plus the fallback adjacency and
//! per-provider budgets between them, and runs the background workers that
//! sweep expired cache entries and monitor budget exhaustion.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetConfig, BudgetSnapshot, BudgetState};
use crate::circuit::CircuitState;
use crate::guard::ProviderGuard;
use crate::telemetry::{CoordinatorEvent, LatencyQuantiles, TelemetrySink};

const MAX_FALLBACK_EVENTS: usize = 512;
const BUDGET_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

struct ProviderEntry {
    guard: ProviderGuard,
    fallback_chain: Vec<String>,
    budget: Arc<BudgetState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub name: String,
    pub circuit_state: CircuitState,
    pub cache_hit_rate: f64,
    pub latency: LatencyQuantiles,
    pub budget: BudgetSnapshot,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub providers: Vec<ProviderHealth>,
    pub overall: OverallStatus,
}

/// Coordinates a fleet of provider guards: which one is currently usable,
/// what it falls back to, and how close it is to its request budget.
pub struct MultiProviderCoordinator {
    providers: RwLock<HashMap<String, ProviderEntry>>,
    fallback_events: Mutex<VecDeque<CoordinatorEvent>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiProviderCoordinator {
    pub fn new(telemetry: Option<Arc<dyn TelemetrySink>>) -> Arc<Self> {
        Arc::new(Self {
            providers: RwLock::new(HashMap::new()),
            fallback_events: Mutex::new(VecDeque::new()),
            telemetry,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn register_provider(
        &self,
        name: impl Into<String>,
        guard: ProviderGuard,
        fallback_chain: Vec<String>,
        budget_config: BudgetConfig,
    ) {
        let name = name.into();
        let entry = ProviderEntry {
            guard,
            fallback_chain,
            budget: Arc::new(BudgetState::new(budget_config, Utc::now())),
        };
        self.providers.write().unwrap_or_else(|p| p.into_inner()).insert(name, entry);
    }

    /// Whether `name` is currently usable: circuit not open and not below
    /// its fallback budget floor.
    pub fn can(&self, name: &str) -> bool {
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        match providers.get(name) {
            Some(entry) => {
                entry.guard.circuit_state() != CircuitState::Open && !entry.budget.is_below_fallback_floor()
            }
            None => false,
        }
    }

    /// Records one consumed unit of `name`'s budget.
    pub fn record(&self, name: &str, weight: u64) {
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = providers.get(name) {
            entry.budget.record(Utc::now(), weight);
        }
    }

    /// Walks `name`'s fallback chain, returning the first provider that
    /// `can()` currently serve. Emits `FallbackUsed`/`FallbackExhausted`
    /// telemetry as it goes.
    pub fn active_provider(&self, name: &str) -> Option<String> {
        if self.can(name) {
            return Some(name.to_string());
        }

        let chain = {
            let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
            providers.get(name)?.fallback_chain.clone()
        };

        for candidate in &chain {
            if self.can(candidate) {
                self.record_fallback_event(CoordinatorEvent::FallbackUsed {
                    from: name.to_string(),
                    to: candidate.clone(),
                    reason: "primary unusable".into(),
                });
                return Some(candidate.clone());
            }
        }

        self.record_fallback_event(CoordinatorEvent::FallbackExhausted { provider: name.to_string() });
        None
    }

    /// `CheckBudget(provider, remaining_fraction)`: forces `name`'s circuit
    /// open when `remaining_fraction` falls below its configured fallback
    /// floor. This is the on-demand counterpart to the periodic budget
    /// monitor tick — a collaborator that already knows its own remaining
    /// fraction (e.g. from a response header) can trip the breaker
    /// immediately instead of waiting for the next tick. Returns `true` if
    /// the circuit was forced open.
    pub fn check_budget(&self, name: &str, remaining_fraction: f64) -> bool {
        let floor = {
            let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
            match providers.get(name) {
                Some(entry) => entry.budget.fallback_floor(),
                None => return false,
            }
        };

        if remaining_fraction >= floor {
            return false;
        }

        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = providers.get(name) {
            entry.guard.circuit().force_open();
        }
        drop(providers);
        self.record_fallback_event(CoordinatorEvent::ForcedOpen { provider: name.to_string(), remaining_fraction });
        true
    }

    /// Point-in-time snapshot of `name`'s budget counters, independent of
    /// the force-open decision in [`Self::check_budget`].
    pub fn budget_snapshot(&self, name: &str) -> Option<BudgetSnapshot> {
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        providers.get(name).map(|entry| entry.budget.snapshot())
    }

    /// A point-in-time rollup across every registered provider.
    pub fn snapshot(&self) -> HealthReport {
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        let mut health = Vec::with_capacity(providers.len());
        let mut cache_attempts = 0u64;

        for (name, entry) in providers.iter() {
            let counters = entry.guard.counters();
            cache_attempts += counters.cache_hits.load(std::sync::atomic::Ordering::Relaxed)
                + counters.cache_misses.load(std::sync::atomic::Ordering::Relaxed);
            health.push(ProviderHealth {
                name: name.clone(),
                circuit_state: entry.guard.circuit_state(),
                cache_hit_rate: counters.cache_hit_rate(),
                latency: entry.guard.latency_quantiles(),
                budget: entry.budget.snapshot(),
                last_success: entry.guard.circuit().last_success(),
                last_failure: entry.guard.circuit().last_failure(),
            });
        }

        let overall = overall_status(&health, cache_attempts > 0);

        HealthReport { providers: health, overall }
    }

    pub fn fallback_events(&self) -> Vec<CoordinatorEvent> {
        self.fallback_events.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    fn record_fallback_event(&self, event: CoordinatorEvent) {
        emit_best_effort_coordinator(self.telemetry.as_deref(), event.clone());
        let mut events = self.fallback_events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= MAX_FALLBACK_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Spawns the cache-expiry sweeper and budget monitor as background
    /// tasks. Call [`Self::shutdown`] to stop them cooperatively.
    pub fn spawn_background_workers(self: &Arc<Self>) {
        let sweeper_token = self.shutdown.child_token();
        let this = Arc::clone(self);
        let sweeper = tokio::spawn(async move { this.run_cache_sweeper(sweeper_token).await });

        let monitor_token = self.shutdown.child_token();
        let this = Arc::clone(self);
        let monitor = tokio::spawn(async move { this.run_budget_monitor(monitor_token).await });

        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        workers.push(sweeper);
        workers.push(monitor);
    }

    /// Cooperative shutdown: signals all background workers and waits for
    /// them to terminate within their own tick, concurrently rather than
    /// one at a time.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        let _ = join_all(handles).await;
    }

    async fn run_cache_sweeper(self: Arc<Self>, token: CancellationToken) {
        loop {
            let intervals: Vec<(String, Duration, i64)> = {
                let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
                providers
                    .iter()
                    .map(|(name, entry)| {
                        let ttl = entry.guard.ttl();
                        (name.clone(), (ttl / 4).max(Duration::from_millis(100)), ttl.as_millis() as i64)
                    })
                    .collect()
            };

            // Sweep once per loop iteration using the shortest configured
            // quarter-TTL as the cadence; providers with longer TTLs simply
            // get swept more often than strictly necessary.
            let cadence = intervals.iter().map(|(_, d, _)| *d).min().unwrap_or(Duration::from_secs(15));

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(cadence) => {}
            }

            let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
            let now = Utc::now();
            for (name, ttl_ms) in intervals.iter().map(|(n, _, ttl)| (n, *ttl)) {
                if let Some(entry) = providers.get(name) {
                    let removed = entry.guard.cache().sweep_expired(now, ttl_ms, 256);
                    if removed > 0 {
                        tracing::debug!(provider = %name, removed, "coordinator: swept expired cache entries");
                    }
                }
            }
        }
    }

    async fn run_budget_monitor(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(BUDGET_MONITOR_INTERVAL) => {}
            }

            let snapshots: Vec<(String, f64, bool, bool)> = {
                let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
                providers
                    .iter()
                    .map(|(name, entry)| {
                        (
                            name.clone(),
                            entry.budget.remaining_fraction(),
                            entry.budget.is_below_fallback_floor(),
                            entry.budget.is_above_warning_threshold(),
                        )
                    })
                    .collect()
            };

            for (name, remaining_fraction, below_floor, above_warning) in snapshots {
                if below_floor {
                    let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
                    if let Some(entry) = providers.get(&name) {
                        entry.guard.circuit().force_open();
                    }
                    drop(providers);
                    self.record_fallback_event(CoordinatorEvent::ForcedOpen { provider: name, remaining_fraction });
                } else if above_warning {
                    self.record_fallback_event(CoordinatorEvent::BudgetWarning { provider: name, remaining_fraction });
                }
            }
        }
    }
}

/// §6's composite rollup: healthy needs a majority of providers individually
/// healthy (circuit closed and budget above half), a majority of circuits
/// closed, a 70% aggregate cache-hit rate, and sub-10s P99 latency. Degraded
/// relaxes every bar; below that, unhealthy. A provider is "individually
/// healthy" when its circuit is closed and it has spent less than half its
/// tighter (daily/monthly) budget.
///
/// Cache-hit rate is only scored once at least one guard has seen cache
/// traffic — a freshly registered fleet with zero requests has no basis to
/// judge a hit rate on, so it is excluded from the healthy/degraded gates
/// rather than counted as a 0% failure.
fn overall_status(providers: &[ProviderHealth], has_cache_traffic: bool) -> OverallStatus {
    if providers.is_empty() {
        return OverallStatus::Healthy;
    }

    let total = providers.len() as f64;
    let healthy_fraction = providers
        .iter()
        .filter(|p| p.circuit_state == CircuitState::Closed && p.budget.health_percent() >= 50.0)
        .count() as f64
        / total;
    let closed_fraction =
        providers.iter().filter(|p| p.circuit_state == CircuitState::Closed).count() as f64 / total;
    let avg_cache_hit_rate = providers.iter().map(|p| p.cache_hit_rate).sum::<f64>() / total;
    let p99 = providers.iter().map(|p| p.latency.p99).max().unwrap_or_default();

    let cache_ok = |floor: f64| !has_cache_traffic || avg_cache_hit_rate >= floor;

    if healthy_fraction >= 0.5
        && closed_fraction >= 0.5
        && cache_ok(0.70)
        && p99 < Duration::from_secs(10)
    {
        OverallStatus::Healthy
    } else if healthy_fraction >= 0.25
        && closed_fraction >= 0.25
        && cache_ok(0.40)
        && p99 < Duration::from_secs(30)
    {
        OverallStatus::Degraded
    } else {
        OverallStatus::Unhealthy
    }
}

fn emit_best_effort_coordinator(sink: Option<&dyn TelemetrySink>, event: CoordinatorEvent) {
    if let Some(sink) = sink {
        sink.emit_coordinator_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardConfig;
    use crate::telemetry::InMemorySink;

    fn guard(name: &str) -> ProviderGuard {
        ProviderGuard::new(GuardConfig { name: name.into(), ..Default::default() })
    }

    #[test]
    fn unregistered_provider_cannot_be_used() {
        let coordinator = MultiProviderCoordinator::new(None);
        assert!(!coordinator.can("missing"));
    }

    #[test]
    fn active_provider_returns_primary_when_usable() {
        let coordinator = MultiProviderCoordinator::new(None);
        coordinator.register_provider("primary", guard("primary"), vec!["secondary".into()], BudgetConfig::default());
        assert_eq!(coordinator.active_provider("primary"), Some("primary".to_string()));
    }

    #[test]
    fn active_provider_falls_back_when_primary_circuit_is_open() {
        let coordinator = MultiProviderCoordinator::new(None);
        let primary = guard("primary");
        for _ in 0..primary_failure_threshold() {
            primary.circuit().record_failure();
        }
        coordinator.register_provider("primary", primary, vec!["secondary".into()], BudgetConfig::default());
        coordinator.register_provider("secondary", guard("secondary"), vec![], BudgetConfig::default());

        assert_eq!(coordinator.active_provider("primary"), Some("secondary".to_string()));
    }

    fn primary_failure_threshold() -> usize {
        GuardConfig::default().failure_threshold
    }

    #[test]
    fn exhausted_fallback_chain_returns_none_and_emits_event() {
        let sink = Arc::new(InMemorySink::new());
        let coordinator = MultiProviderCoordinator::new(Some(sink.clone()));
        let primary = guard("primary");
        for _ in 0..primary_failure_threshold() {
            primary.circuit().record_failure();
        }
        coordinator.register_provider("primary", primary, vec![], BudgetConfig::default());

        assert_eq!(coordinator.active_provider("primary"), None);
        let events = sink.coordinator_events();
        assert!(matches!(events.last(), Some(CoordinatorEvent::FallbackExhausted { .. })));
    }

    #[test]
    fn snapshot_reports_healthy_when_all_circuits_closed() {
        let coordinator = MultiProviderCoordinator::new(None);
        coordinator.register_provider("a", guard("a"), vec![], BudgetConfig::default());
        coordinator.register_provider("b", guard("b"), vec![], BudgetConfig::default());

        let report = coordinator.snapshot();
        assert_eq!(report.overall, OverallStatus::Healthy);
        assert_eq!(report.providers.len(), 2);
    }

    #[test]
    fn snapshot_reports_unhealthy_when_majority_open() {
        let coordinator = MultiProviderCoordinator::new(None);
        let broken = guard("broken");
        for _ in 0..primary_failure_threshold() {
            broken.circuit().record_failure();
        }
        coordinator.register_provider("broken", broken, vec![], BudgetConfig::default());

        let report = coordinator.snapshot();
        assert_eq!(report.overall, OverallStatus::Unhealthy);
    }

    #[test]
    fn snapshot_reports_degraded_when_only_a_quarter_of_the_fleet_is_healthy() {
        let coordinator = MultiProviderCoordinator::new(None);
        coordinator.register_provider("a", guard("a"), vec![], BudgetConfig::default());
        for name in ["broken1", "broken2", "broken3"] {
            let b = guard(name);
            for _ in 0..primary_failure_threshold() {
                b.circuit().record_failure();
            }
            coordinator.register_provider(name, b, vec![], BudgetConfig::default());
        }

        let report = coordinator.snapshot();
        assert_eq!(report.overall, OverallStatus::Degraded);
    }

    #[test]
    fn snapshot_surfaces_last_success_and_last_failure_timestamps() {
        let coordinator = MultiProviderCoordinator::new(None);
        let g = guard("a");
        g.circuit().record_failure();
        coordinator.register_provider("a", g, vec![], BudgetConfig::default());

        let report = coordinator.snapshot();
        assert!(report.providers[0].last_failure.is_some());
        assert!(report.providers[0].last_success.is_none());
    }

    #[tokio::test]
    async fn background_workers_start_and_shut_down_cleanly() {
        let coordinator = MultiProviderCoordinator::new(None);
        coordinator.register_provider("a", guard("a"), vec![], BudgetConfig::default());
        coordinator.spawn_background_workers();
        coordinator.shutdown().await;
    }

    #[test]
    fn check_budget_forces_circuit_open_below_floor() {
        let sink = Arc::new(InMemorySink::new());
        let coordinator = MultiProviderCoordinator::new(Some(sink.clone()));
        let budget = BudgetConfig { fallback_threshold: 0.95, ..Default::default() };
        coordinator.register_provider("a", guard("a"), vec![], budget);

        // floor = 1 - 0.95 = 0.05; 0.02 remaining is below it.
        assert!(coordinator.check_budget("a", 0.02));
        assert_eq!(coordinator.can("a"), false);
        let events = sink.coordinator_events();
        assert!(matches!(events.last(), Some(CoordinatorEvent::ForcedOpen { .. })));
    }

    #[test]
    fn check_budget_does_not_force_open_above_floor() {
        let coordinator = MultiProviderCoordinator::new(None);
        let budget = BudgetConfig { fallback_threshold: 0.95, ..Default::default() };
        coordinator.register_provider("a", guard("a"), vec![], budget);

        assert!(!coordinator.check_budget("a", 0.5));
        assert!(coordinator.can("a"));
    }

    #[test]
    fn check_budget_on_unregistered_provider_returns_false() {
        let coordinator = MultiProviderCoordinator::new(None);
        assert!(!coordinator.check_budget("missing", 0.0));
    }
}
