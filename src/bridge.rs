//! Cascades a read across Hot/Warm/Cold tiers by freshness and authority,
//! recording the fallback chain as it goes.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::errors::AllTiersFailed;
use crate::tier::{TierHandle, TierName};

pub use crate::envelope::should_accept as should_accept_envelope;

/// What kind of record `get` is fetching; dispatches to the matching tier method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    OrderBook,
    Price,
}

pub struct TierSlot {
    pub name: TierName,
    pub handle: Box<dyn TierHandle>,
    /// Overrides [`TierName::default_max_age_ms`] when set.
    pub max_age_ms: Option<Option<i64>>,
}

impl TierSlot {
    fn effective_max_age_ms(&self) -> Option<i64> {
        self.max_age_ms.unwrap_or_else(|| self.name.default_max_age_ms())
    }
}

/// Cascades `Get` across the three injected tier handles in hot→warm→cold order.
pub struct TieredBridge {
    tiers: Vec<TierSlot>,
}

impl TieredBridge {
    pub fn new(hot: Box<dyn TierHandle>, warm: Box<dyn TierHandle>, cold: Box<dyn TierHandle>) -> Self {
        Self {
            tiers: vec![
                TierSlot { name: TierName::Hot, handle: hot, max_age_ms: None },
                TierSlot { name: TierName::Warm, handle: warm, max_age_ms: None },
                TierSlot { name: TierName::Cold, handle: cold, max_age_ms: None },
            ],
        }
    }

    pub async fn get_order_book(
        &self,
        token: CancellationToken,
        venue: &str,
        symbol: &str,
    ) -> Result<Envelope, AllTiersFailed> {
        self.get(RequestKind::OrderBook, token, venue, symbol).await
    }

    pub async fn get_price(
        &self,
        token: CancellationToken,
        venue: &str,
        symbol: &str,
    ) -> Result<Envelope, AllTiersFailed> {
        self.get(RequestKind::Price, token, venue, symbol).await
    }

    async fn get(
        &self,
        kind: RequestKind,
        token: CancellationToken,
        venue: &str,
        symbol: &str,
    ) -> Result<Envelope, AllTiersFailed> {
        let mut fallback_chain = Vec::new();

        for slot in &self.tiers {
            if !slot.handle.available(token.clone(), venue).await {
                continue;
            }

            let result = match kind {
                RequestKind::OrderBook => slot.handle.get_order_book(token.clone(), venue, symbol).await,
                RequestKind::Price => slot.handle.get_price(token.clone(), venue, symbol).await,
            };

            let envelope = match result {
                Ok(envelope) => envelope,
                Err(err) => {
                    fallback_chain.push(format!("{}-failed:{}", slot.name, err));
                    tracing::debug!(tier = %slot.name, error = %err, "bridge: tier call failed");
                    continue;
                }
            };

            let now = Utc::now();
            if let Some(max_age_ms) = slot.effective_max_age_ms() {
                let freshness_ms = envelope.compute_freshness(now);
                if freshness_ms > max_age_ms {
                    fallback_chain.push(format!("{}-stale:{}ms", slot.name, freshness_ms));
                    continue;
                }
            }

            let mut stamped = envelope.with_fallback_chain(fallback_chain);
            stamped.source_tier = tier_name_to_tier(slot.name);
            return Ok(stamped);
        }

        Err(AllTiersFailed { chain: fallback_chain })
    }
}

fn tier_name_to_tier(name: TierName) -> crate::envelope::Tier {
    match name {
        TierName::Hot => crate::envelope::Tier::Hot,
        TierName::Warm => crate::envelope::Tier::Warm,
        TierName::Cold => crate::envelope::Tier::Cold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeOptions, PayloadKind, Tier};
    use crate::errors::GuardError;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    struct StubTier {
        name: &'static str,
        response: Mutex<Option<Result<Envelope, GuardError>>>,
    }

    #[async_trait]
    impl TierHandle for StubTier {
        async fn get_order_book(
            &self,
            _token: CancellationToken,
            _venue: &str,
            _symbol: &str,
        ) -> Result<Envelope, GuardError> {
            self.response.lock().unwrap().take().unwrap_or_else(|| {
                Err(GuardError::Network { message: format!("{} not configured", self.name) })
            })
        }

        async fn get_price(
            &self,
            token: CancellationToken,
            venue: &str,
            symbol: &str,
        ) -> Result<Envelope, GuardError> {
            self.get_order_book(token, venue, symbol).await
        }

        async fn available(&self, _token: CancellationToken, _venue: &str) -> bool {
            true
        }
    }

    fn envelope(tier: Tier, freshness_ms: i64) -> Envelope {
        let now = Utc::now();
        Envelope::new(
            "binance",
            "BTCUSD",
            tier,
            now - ChronoDuration::milliseconds(freshness_ms),
            now,
            PayloadKind::PriceTick,
            b"tick".to_vec(),
            EnvelopeOptions::default(),
        )
    }

    fn bridge(hot: StubTier, warm: StubTier, cold: StubTier) -> TieredBridge {
        TieredBridge::new(Box::new(hot), Box::new(warm), Box::new(cold))
    }

    #[tokio::test]
    async fn hot_success_returns_hot_tier_with_empty_chain() {
        let hot = StubTier { name: "hot", response: Mutex::new(Some(Ok(envelope(Tier::Hot, 1_000)))) };
        let warm = StubTier { name: "warm", response: Mutex::new(None) };
        let cold = StubTier { name: "cold", response: Mutex::new(None) };

        let result = bridge(hot, warm, cold)
            .get_order_book(CancellationToken::new(), "binance", "BTCUSD")
            .await
            .unwrap();

        assert_eq!(result.source_tier, Tier::Hot);
        assert!(result.provenance.fallback_chain.is_empty());
        assert_eq!(result.authority(), 3);
    }

    #[tokio::test]
    async fn hot_fails_warm_succeeds() {
        let hot = StubTier {
            name: "hot",
            response: Mutex::new(Some(Err(GuardError::Network { message: "connection failed".into() }))),
        };
        let warm = StubTier { name: "warm", response: Mutex::new(Some(Ok(envelope(Tier::Warm, 30_000)))) };
        let cold = StubTier { name: "cold", response: Mutex::new(None) };

        let result = bridge(hot, warm, cold)
            .get_order_book(CancellationToken::new(), "binance", "BTCUSD")
            .await
            .unwrap();

        assert_eq!(result.source_tier, Tier::Warm);
        assert_eq!(result.provenance.fallback_chain, vec!["hot-failed:network error: connection failed"]);
    }

    #[tokio::test]
    async fn hot_stale_warm_succeeds() {
        let hot = StubTier { name: "hot", response: Mutex::new(Some(Ok(envelope(Tier::Hot, 10_000)))) };
        let warm = StubTier { name: "warm", response: Mutex::new(Some(Ok(envelope(Tier::Warm, 30_000)))) };
        let cold = StubTier { name: "cold", response: Mutex::new(None) };

        let result = bridge(hot, warm, cold)
            .get_order_book(CancellationToken::new(), "binance", "BTCUSD")
            .await
            .unwrap();

        assert_eq!(result.source_tier, Tier::Warm);
        assert_eq!(result.provenance.fallback_chain, vec!["hot-stale:10000ms"]);
    }

    #[tokio::test]
    async fn all_tiers_fail_returns_full_chain() {
        let hot = StubTier {
            name: "hot",
            response: Mutex::new(Some(Err(GuardError::Network { message: "hot-failed".into() }))),
        };
        let warm = StubTier {
            name: "warm",
            response: Mutex::new(Some(Err(GuardError::Network { message: "warm-failed".into() }))),
        };
        let cold = StubTier {
            name: "cold",
            response: Mutex::new(Some(Err(GuardError::Network { message: "cold-failed".into() }))),
        };

        let err = bridge(hot, warm, cold)
            .get_order_book(CancellationToken::new(), "binance", "BTCUSD")
            .await
            .unwrap_err();

        assert_eq!(err.chain.len(), 3);
        assert!(err.chain[0].contains("hot-failed"));
        assert!(err.chain[1].contains("warm-failed"));
        assert!(err.chain[2].contains("cold-failed"));
    }
}
