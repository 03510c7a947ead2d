//! Staleness checking: extracts a timestamp from a generic record and
//! compares its skew against a tier's max-skew.

use super::schema::RecordValue;
use crate::errors::{StalenessDirection, StalenessError};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

const RECOGNIZED_TIMESTAMP_FIELDS: &[&str] = &["produced_at", "timestamp", "ts", "time"];

#[derive(Debug, Clone, Copy)]
pub struct StalenessConfig {
    /// Sub-limit negative skew tolerated before treating a record as future-dated.
    pub clock_tolerance_ms: i64,
    /// Beyond this, in the future, a record is `future-stale` regardless of clock tolerance.
    pub max_future_window_ms: i64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self { clock_tolerance_ms: 1_000, max_future_window_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessResult {
    pub skew_ms: i64,
    pub stale: bool,
    pub direction: Option<StalenessDirection>,
}

pub struct StalenessChecker {
    config: StalenessConfig,
}

impl StalenessChecker {
    pub fn new(config: StalenessConfig) -> Self {
        Self { config }
    }

    /// `skew = now - timestamp`. Beyond `limit_ms` in the past → past-stale;
    /// beyond `max_future_window_ms` in the future → future-stale. A small
    /// clock-tolerance band around zero absorbs ordinary clock drift.
    pub fn check(
        &self,
        record: &HashMap<String, RecordValue>,
        limit_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<StalenessResult, StalenessError> {
        let timestamp = extract_timestamp(record).ok_or_else(|| StalenessError {
            skew_ms: 0,
            limit_ms,
            direction: StalenessDirection::Past,
        })?;

        let skew_ms = (now - timestamp).num_milliseconds();

        if skew_ms < -self.config.clock_tolerance_ms {
            let future_skew = -skew_ms;
            if future_skew > self.config.max_future_window_ms {
                return Err(StalenessError { skew_ms, limit_ms, direction: StalenessDirection::Future });
            }
            return Ok(StalenessResult { skew_ms, stale: false, direction: None });
        }

        if skew_ms > limit_ms {
            return Err(StalenessError { skew_ms, limit_ms, direction: StalenessDirection::Past });
        }

        Ok(StalenessResult { skew_ms, stale: false, direction: None })
    }
}

fn extract_timestamp(record: &HashMap<String, RecordValue>) -> Option<DateTime<Utc>> {
    for field in RECOGNIZED_TIMESTAMP_FIELDS {
        match record.get(*field) {
            Some(RecordValue::Timestamp(ts)) => return Some(*ts),
            Some(RecordValue::String(s)) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                    return Some(parsed.with_timezone(&Utc));
                }
            }
            Some(RecordValue::Number(n)) => {
                if let Some(ts) = epoch_number_to_timestamp(*n) {
                    return Some(ts);
                }
            }
            _ => {}
        }
    }
    None
}

/// Range-sanity-checked unit detection: seconds (~1e9–1e10), milliseconds
/// (~1e12–1e13), microseconds (~1e15–1e16), nanoseconds (~1e18–1e19).
fn epoch_number_to_timestamp(n: f64) -> Option<DateTime<Utc>> {
    let magnitude = n.abs();
    let (secs, nanos) = if magnitude < 1e11 {
        (n as i64, 0u32)
    } else if magnitude < 1e14 {
        let millis = n as i64;
        (millis.div_euclid(1000), (millis.rem_euclid(1000) * 1_000_000) as u32)
    } else if magnitude < 1e17 {
        let micros = n as i64;
        (micros.div_euclid(1_000_000), (micros.rem_euclid(1_000_000) * 1_000) as u32)
    } else {
        let nanos_total = n as i64;
        (nanos_total.div_euclid(1_000_000_000), nanos_total.rem_euclid(1_000_000_000) as u32)
    };
    Utc.timestamp_opt(secs, nanos).single()
}
