//! Per-provider request-budget tracking: daily/monthly usage counters with
//! rolling reset anchors, optional weighted units, and the warning/fallback
//! thresholds the coordinator uses to force a circuit open.
//!
//! Threshold semantics are fixed to a single convention: fractions in
//! `[0, 1]`, never percentages (the spec's source material mixed the two;
//! this crate does not reproduce that ambiguity).

use chrono::{DateTime, Datelike, Utc};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub daily_requests: u64,
    pub monthly_budget: u64,
    pub weight_limit: Option<u64>,
    /// Fraction in [0, 1]: usage above this emits a warning-level event.
    pub warning_threshold: f64,
    /// Fraction in [0, 1]: remaining-fraction below this forces the circuit open.
    pub fallback_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_requests: 10_000,
            monthly_budget: 250_000,
            weight_limit: None,
            warning_threshold: 0.8,
            fallback_threshold: 0.95,
        }
    }
}

struct Counters {
    daily_used: u64,
    monthly_used: u64,
    weight_used: u64,
    daily_reset_at: DateTime<Utc>,
    monthly_reset_at: DateTime<Utc>,
}

/// Per-provider budget state. The process-lifetime counters reset
/// automatically on the next `record` call once their anchor has elapsed.
pub struct BudgetState {
    config: BudgetConfig,
    counters: Mutex<Counters>,
}

impl BudgetState {
    pub fn new(config: BudgetConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters {
                daily_used: 0,
                monthly_used: 0,
                weight_used: 0,
                daily_reset_at: next_daily_anchor(now),
                monthly_reset_at: next_monthly_anchor(now),
            }),
        }
    }

    /// Records one consumed request (plus optional weighted units), rolling
    /// over daily/monthly counters whose anchor has passed.
    pub fn record(&self, now: DateTime<Utc>, weight: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        if now >= counters.daily_reset_at {
            counters.daily_used = 0;
            counters.daily_reset_at = next_daily_anchor(now);
        }
        if now >= counters.monthly_reset_at {
            counters.monthly_used = 0;
            counters.weight_used = 0;
            counters.monthly_reset_at = next_monthly_anchor(now);
        }
        counters.daily_used += 1;
        counters.monthly_used += 1;
        counters.weight_used += weight;
    }

    /// Fraction of the daily/monthly budget remaining (the tighter of the two).
    pub fn remaining_fraction(&self) -> f64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let daily_remaining = remaining(counters.daily_used, self.config.daily_requests);
        let monthly_remaining = remaining(counters.monthly_used, self.config.monthly_budget);
        daily_remaining.min(monthly_remaining)
    }

    pub fn is_below_fallback_floor(&self) -> bool {
        self.remaining_fraction() < self.fallback_floor()
    }

    /// The remaining-fraction floor below which the coordinator forces this
    /// provider's circuit open.
    pub fn fallback_floor(&self) -> f64 {
        1.0 - self.config.fallback_threshold
    }

    pub fn is_above_warning_threshold(&self) -> bool {
        let used_fraction = 1.0 - self.remaining_fraction();
        used_fraction >= self.config.warning_threshold
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        BudgetSnapshot {
            daily_used: counters.daily_used,
            daily_quota: self.config.daily_requests,
            monthly_used: counters.monthly_used,
            monthly_budget: self.config.monthly_budget,
            weight_used: counters.weight_used,
            weight_limit: self.config.weight_limit,
        }
    }
}

fn remaining(used: u64, quota: u64) -> f64 {
    if quota == 0 {
        return 0.0;
    }
    (1.0 - used as f64 / quota as f64).clamp(0.0, 1.0)
}

fn next_daily_anchor(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + chrono::Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
}

fn next_monthly_anchor(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 { (now.year() + 1, 1) } else { (now.year(), now.month() + 1) };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first of month is always valid")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetSnapshot {
    pub daily_used: u64,
    pub daily_quota: u64,
    pub monthly_used: u64,
    pub monthly_budget: u64,
    pub weight_used: u64,
    pub weight_limit: Option<u64>,
}

impl BudgetSnapshot {
    /// `100 - max(daily%, monthly%)`, per the observability surface contract.
    pub fn health_percent(&self) -> f64 {
        let daily_pct = pct(self.daily_used, self.daily_quota);
        let monthly_pct = pct(self.monthly_used, self.monthly_budget);
        100.0 - daily_pct.max(monthly_pct)
    }
}

fn pct(used: u64, quota: u64) -> f64 {
    if quota == 0 {
        return 100.0;
    }
    (used as f64 / quota as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_fraction_starts_at_one() {
        let state = BudgetState::new(BudgetConfig::default(), Utc::now());
        assert_eq!(state.remaining_fraction(), 1.0);
    }

    #[test]
    fn remaining_fraction_tracks_the_tighter_quota() {
        let config = BudgetConfig { daily_requests: 10, monthly_budget: 1000, ..Default::default() };
        let state = BudgetState::new(config, Utc::now());
        for _ in 0..9 {
            state.record(Utc::now(), 1);
        }
        assert!((state.remaining_fraction() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn fallback_floor_trips_below_configured_threshold() {
        let config = BudgetConfig {
            daily_requests: 100,
            monthly_budget: 100_000,
            fallback_threshold: 0.95,
            ..Default::default()
        };
        let state = BudgetState::new(config, Utc::now());
        for _ in 0..94 {
            state.record(Utc::now(), 1);
        }
        assert!(!state.is_below_fallback_floor());
        state.record(Utc::now(), 1);
        assert!(state.is_below_fallback_floor());
    }

    #[test]
    fn health_percent_uses_the_worse_of_daily_and_monthly() {
        let snapshot = BudgetSnapshot {
            daily_used: 90,
            daily_quota: 100,
            monthly_used: 10,
            monthly_budget: 1000,
            weight_used: 0,
            weight_limit: None,
        };
        assert_eq!(snapshot.health_percent(), 10.0);
    }

    #[test]
    fn daily_counter_resets_after_anchor_elapses() {
        let state = BudgetState::new(BudgetConfig::default(), Utc::now());
        state.record(Utc::now(), 1);
        assert!(state.remaining_fraction() < 1.0);

        let tomorrow = Utc::now() + chrono::Duration::days(1);
        state.record(tomorrow, 1);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.daily_used, 1);
    }
}
