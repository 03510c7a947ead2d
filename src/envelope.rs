//! The lingua franca record carried between every component: a payload plus
//! source tier, timestamps, freshness, checksum, and provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Freshness stratum a record was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    /// Total order used to merge records describing the same logical fact.
    /// Unknown tiers (not representable here, but kept for API symmetry with
    /// `Envelope::authority`) resolve to 0.
    pub fn authority(self) -> u8 {
        match self {
            Tier::Hot => 3,
            Tier::Warm => 2,
            Tier::Cold => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged union of payload shapes. The body stays an opaque byte string; the
/// kind selects the canonical encoder used by `compute_checksum`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    OrderBook,
    PriceTick,
    OhlcvBar,
    Other(String),
}

impl PayloadKind {
    fn tag(&self) -> &str {
        match self {
            PayloadKind::OrderBook => "order-book",
            PayloadKind::PriceTick => "price-tick",
            PayloadKind::OhlcvBar => "ohlcv-bar",
            PayloadKind::Other(name) => name,
        }
    }
}

/// Audit trail and confidence metadata attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub original_source: String,
    pub latency_ms: u64,
    pub retry_count: u32,
    pub cache_hit: bool,
    pub fallback_chain: Vec<String>,
    pub confidence_score: f64,
}

/// The record carried between the bridge, guards, and collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub venue: String,
    pub symbol: String,
    pub source_tier: Tier,
    pub produced_at: DateTime<Utc>,
    pub retrieved_at: DateTime<Utc>,
    pub payload_kind: PayloadKind,
    pub payload: Vec<u8>,
    pub checksum: String,
    pub provenance: Provenance,
}

/// Construction options for [`Envelope::new`].
#[derive(Default)]
pub struct EnvelopeOptions {
    pub fallback_chain: Vec<String>,
    pub cache_hit: bool,
    pub confidence_score: f64,
    pub original_source: String,
    pub latency_ms: u64,
    pub retry_count: u32,
}

impl Envelope {
    pub fn new(
        venue: impl Into<String>,
        symbol: impl Into<String>,
        tier: Tier,
        produced_at: DateTime<Utc>,
        retrieved_at: DateTime<Utc>,
        payload_kind: PayloadKind,
        payload: Vec<u8>,
        options: EnvelopeOptions,
    ) -> Self {
        let checksum = compute_checksum(&payload_kind, &payload);
        Envelope {
            venue: venue.into(),
            symbol: symbol.into(),
            source_tier: tier,
            produced_at,
            retrieved_at,
            payload_kind,
            payload,
            checksum,
            provenance: Provenance {
                original_source: options.original_source,
                latency_ms: options.latency_ms,
                retry_count: options.retry_count,
                cache_hit: options.cache_hit,
                fallback_chain: options.fallback_chain,
                confidence_score: options.confidence_score.clamp(0.0, 1.0),
            },
        }
    }

    /// `retrieved_at - produced_at`, clamped to zero (clock-skew tolerance is
    /// applied by the staleness checker, not here).
    pub fn compute_freshness(&self, now: DateTime<Utc>) -> i64 {
        (now - self.produced_at).num_milliseconds().max(0)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, limit_ms: i64) -> bool {
        self.compute_freshness(now) > limit_ms
    }

    pub fn authority(&self) -> u8 {
        self.source_tier.authority()
    }

    pub fn with_fallback_chain(mut self, chain: Vec<String>) -> Self {
        self.provenance.fallback_chain = chain;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.provenance.cache_hit = cache_hit;
        self
    }

    pub fn with_confidence(mut self, score: f64) -> Self {
        self.provenance.confidence_score = score.clamp(0.0, 1.0);
        self
    }
}

/// 256-bit content hash over a canonical `kind_tag || 0x00 || payload` byte
/// encoding, hex-digested. Identical `(payload, kind)` inputs MUST yield
/// identical digests across processes and versions.
pub fn compute_checksum(kind: &PayloadKind, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.tag().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    let digest = hasher.finalize();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// "Worst feed never overwrites best feed": accept `incoming` over `existing`
/// iff its authority is at least as high; ties break to the later `produced_at`.
pub fn should_accept(existing: &Envelope, incoming: &Envelope) -> bool {
    match incoming.authority().cmp(&existing.authority()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => incoming.produced_at >= existing.produced_at,
    }
}
