use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::limits::ByteLimit;
use crate::throttle::TierUsage;

/// `GET` on a metadata resource without a `key` parameter: the sorted
/// key listing for the resolved lookup key.
#[derive(Debug, Serialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
}

/// A single metadata entry, returned by reads and writes.
#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub key: String,
    pub value: String,
}

impl EntryResponse {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub counters_reachable: bool,
}

impl HealthResponse {
    pub fn healthy(counters_reachable: bool) -> Self {
        Self::with_status("healthy", counters_reachable)
    }

    pub fn unhealthy(counters_reachable: bool) -> Self {
        Self::with_status("unhealthy", counters_reachable)
    }

    fn with_status(status: &str, counters_reachable: bool) -> Self {
        Self {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            counters_reachable,
        }
    }
}

/// One tier in the usage report. `limit` is absent for unbounded
/// tiers.
#[derive(Debug, Serialize)]
pub struct TierUsageBody {
    pub tier: String,
    pub entity: String,
    pub current: u64,
    pub limit: Option<u64>,
}

impl From<TierUsage> for TierUsageBody {
    fn from(usage: TierUsage) -> Self {
        Self {
            tier: usage.tier.as_str().to_string(),
            entity: usage.entity,
            current: usage.current,
            limit: match usage.limit {
                ByteLimit::Bytes(bytes) => Some(bytes),
                ByteLimit::Unbounded => None,
            },
        }
    }
}

/// `GET /throttle/usage`: the caller's standing across all tiers plus
/// the accounting window.
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub tiers: Vec<TierUsageBody>,
}

impl UsageResponse {
    pub fn new(window: Duration, report: Vec<TierUsage>) -> Self {
        Self {
            window,
            tiers: report.into_iter().map(TierUsageBody::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::Tier;

    #[test]
    fn usage_serializes_the_window_in_humantime_form() {
        let response = UsageResponse::new(
            Duration::from_secs(3600),
            vec![TierUsage {
                tier: Tier::User,
                entity: "alice".to_string(),
                current: 512,
                limit: ByteLimit::Bytes(1024),
            }],
        );
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["window"], "1h");
        assert_eq!(body["tiers"][0]["tier"], "user");
        assert_eq!(body["tiers"][0]["limit"], 1024);
    }

    #[test]
    fn unbounded_tiers_report_a_null_limit() {
        let body = serde_json::to_value(TierUsageBody::from(TierUsage {
            tier: Tier::System,
            entity: "system".to_string(),
            current: 9,
            limit: ByteLimit::Unbounded,
        }))
        .unwrap();
        assert!(body["limit"].is_null());
    }

    #[test]
    fn health_carries_the_crate_version() {
        let response = HealthResponse::healthy(true);
        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(response.status, "healthy");
    }
}
