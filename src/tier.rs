//! Tier handles injected into the bridge: one each for hot (live/streamed),
//! warm (cached REST), and cold (historical file) reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::errors::GuardError;

/// A freshness stratum the bridge cascades across, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierName {
    Hot,
    Warm,
    Cold,
}

impl TierName {
    pub fn as_str(self) -> &'static str {
        match self {
            TierName::Hot => "hot",
            TierName::Warm => "warm",
            TierName::Cold => "cold",
        }
    }

    /// Default max-age honored by the bridge when deciding `{tier}-stale`.
    pub fn default_max_age_ms(self) -> Option<i64> {
        match self {
            TierName::Hot => Some(5_000),
            TierName::Warm => Some(60_000),
            TierName::Cold => None,
        }
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier's capability set, injected into [`crate::bridge::TieredBridge`].
#[async_trait]
pub trait TierHandle: Send + Sync {
    async fn get_order_book(
        &self,
        token: CancellationToken,
        venue: &str,
        symbol: &str,
    ) -> Result<Envelope, GuardError>;

    async fn get_price(
        &self,
        token: CancellationToken,
        venue: &str,
        symbol: &str,
    ) -> Result<Envelope, GuardError>;

    async fn available(&self, token: CancellationToken, venue: &str) -> bool;

    /// Cold-only: historical slice over a time range. Other tiers return `Ok(vec![])`.
    async fn get_historical_slice(
        &self,
        _token: CancellationToken,
        _venue: &str,
        _symbol: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, GuardError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_age_matches_spec_defaults() {
        assert_eq!(TierName::Hot.default_max_age_ms(), Some(5_000));
        assert_eq!(TierName::Warm.default_max_age_ms(), Some(60_000));
        assert_eq!(TierName::Cold.default_max_age_ms(), None);
    }
}
