use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::counters::CounterStore;
use crate::error::{Error, Result};
use crate::limits::{ByteLimit, Identity, LimitSet};
use crate::notify::Notifier;

const NOTIFY_SUBJECT: &str = "Request Throttled";

/// Throttle tiers, checked in this order for every call. The first
/// violated tier rejects the call; later tiers are never evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    User,
    Api,
    System,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::User => "user",
            Tier::Api => "api",
            Tier::System => "system",
        }
    }

    fn detail(&self) -> &'static str {
        match self {
            Tier::User => "User is throttled. Expected available tomorrow.",
            Tier::Api => "API is throttled. Expected available tomorrow.",
            Tier::System => "System is throttled. Expected available tomorrow.",
        }
    }
}

/// Context attached to throttle notifications. `current_metric` and
/// `max_metric` are filled in only when a tier rejects.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleDetails {
    pub api: String,
    pub user: String,
    pub cost: f64,
    pub fqdn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_metric: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_metric: Option<u64>,
}

/// One tier's usage snapshot, as reported by [`ThrottleEngine::usage`].
#[derive(Debug, Clone)]
pub struct TierUsage {
    pub tier: Tier,
    pub entity: String,
    pub current: u64,
    pub limit: ByteLimit,
}

/// Multi-tier admission control over external usage counters.
///
/// Limits are soft: a call is compared against the counter value
/// *before* its own cost is added, so a single call may push a counter
/// past its limit and only the next call is rejected. Counters are
/// incremented by the truncated cost after a tier passes; an unbounded
/// tier is skipped without incrementing (its counter is still read
/// first, matching the accounting job's expectations).
pub struct ThrottleEngine {
    limits: LimitSet,
    counters: Arc<dyn CounterStore>,
    notifier: Arc<dyn Notifier>,
    fqdn: String,
    retry_after: u64,
}

impl ThrottleEngine {
    pub fn new(
        limits: LimitSet,
        counters: Arc<dyn CounterStore>,
        notifier: Arc<dyn Notifier>,
        fqdn: impl Into<String>,
        retry_after: u64,
    ) -> Self {
        Self {
            limits,
            counters,
            notifier,
            fqdn: fqdn.into(),
            retry_after,
        }
    }

    /// Admit or reject one call of the given cost, charging each
    /// bounded tier that passes. Store failures propagate as-is and
    /// are never reported as throttling.
    pub async fn check(&self, api: &str, identity: &Identity, cost: f64) -> Result<()> {
        let details = ThrottleDetails {
            api: api.to_string(),
            user: identity.name.clone(),
            cost,
            fqdn: self.fqdn.clone(),
            current_metric: None,
            max_metric: None,
        };

        self.check_tier(
            Tier::User,
            &identity.name,
            self.limits.lookup_user(identity),
            cost,
            &details,
        )
        .await?;
        self.check_tier(Tier::Api, api, self.limits.lookup_api(api), cost, &details)
            .await?;
        self.check_tier(
            Tier::System,
            "system",
            self.limits.lookup_system(),
            cost,
            &details,
        )
        .await?;

        Ok(())
    }

    /// Per-tier `{entity, current, limit}` for the given caller,
    /// without charging anything.
    pub async fn usage(&self, api: &str, identity: &Identity) -> Result<Vec<TierUsage>> {
        let tiers = [
            (Tier::User, identity.name.as_str(), self.limits.lookup_user(identity)),
            (Tier::Api, api, self.limits.lookup_api(api)),
            (Tier::System, "system", self.limits.lookup_system()),
        ];

        let mut report = Vec::with_capacity(tiers.len());
        for (tier, entity, limit) in tiers {
            report.push(TierUsage {
                tier,
                entity: entity.to_string(),
                current: self.counters.get_metric(entity).await?,
                limit,
            });
        }
        Ok(report)
    }

    async fn check_tier(
        &self,
        tier: Tier,
        entity: &str,
        limit: ByteLimit,
        cost: f64,
        details: &ThrottleDetails,
    ) -> Result<()> {
        // The read happens before the limit is consulted, even for
        // tiers that turn out unbounded.
        let current = self.counters.get_metric(entity).await?;

        let max = match limit {
            ByteLimit::Unbounded => return Ok(()),
            ByteLimit::Bytes(max) => max,
        };

        if current > max {
            self.alert(tier, entity, details, current, max).await;
            return Err(Error::Throttled {
                tier,
                detail: tier.detail().to_string(),
                retry_after: self.retry_after,
            });
        }

        self.counters
            .add_metric_cost(entity, cost.trunc() as u64)
            .await?;
        Ok(())
    }

    async fn alert(
        &self,
        tier: Tier,
        entity: &str,
        details: &ThrottleDetails,
        current: u64,
        max: u64,
    ) {
        let mut details = details.clone();
        details.current_metric = Some(current);
        details.max_metric = Some(max);
        let body = serde_json::to_string(&details).unwrap_or_default();

        let message = match tier {
            Tier::User => format!("Throttling user '{}': {}", entity, body),
            Tier::Api => format!("Throttling API '{}': {}", entity, body),
            Tier::System => format!("Throttling system: {}", body),
        };

        // Best effort. A dead notifier must not change the admission
        // decision.
        if let Err(err) = self.notifier.publish(NOTIFY_SUBJECT, &message).await {
            warn!("failed to publish throttle notification: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MemoryCounters;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingNotifier {
        events: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for CapturingNotifier {
        async fn publish(&self, subject: &str, message: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((subject.to_string(), message.to_string()));
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn publish(&self, _subject: &str, _message: &str) -> Result<()> {
            Err(Error::Store("notification channel down".to_string()))
        }
    }

    /// Delegates to [`MemoryCounters`] while recording which entities
    /// were read.
    #[derive(Default)]
    struct ProbeCounters {
        inner: MemoryCounters,
        reads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CounterStore for ProbeCounters {
        async fn get_metric(&self, entity: &str) -> Result<u64> {
            self.reads.lock().unwrap().push(entity.to_string());
            self.inner.get_metric(entity).await
        }

        async fn add_metric_cost(&self, entity: &str, cost: u64) -> Result<()> {
            self.inner.add_metric_cost(entity, cost).await
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    struct DeadCounters;

    #[async_trait]
    impl CounterStore for DeadCounters {
        async fn get_metric(&self, _entity: &str) -> Result<u64> {
            Err(Error::Store("redis down".to_string()))
        }

        async fn add_metric_cost(&self, _entity: &str, _cost: u64) -> Result<()> {
            Err(Error::Store("redis down".to_string()))
        }

        async fn ping(&self) -> Result<()> {
            Err(Error::Store("redis down".to_string()))
        }
    }

    fn engine(
        limits_json: &str,
        counters: Arc<dyn CounterStore>,
        notifier: Arc<dyn Notifier>,
    ) -> ThrottleEngine {
        ThrottleEngine::new(
            LimitSet::from_json(limits_json).unwrap(),
            counters,
            notifier,
            "api.example.org",
            86400,
        )
    }

    #[tokio::test]
    async fn admits_under_the_limit_and_charges_bounded_tiers_only() {
        let counters = Arc::new(MemoryCounters::new());
        let notifier = Arc::new(CapturingNotifier::default());
        let engine = engine(
            r#"{"users": {"alice": "1K"}}"#,
            counters.clone(),
            notifier.clone(),
        );

        engine
            .check("meta", &Identity::new("alice"), 100.0)
            .await
            .unwrap();

        assert_eq!(counters.get_metric("alice").await.unwrap(), 100);
        // api and system are unbounded here, so nothing was charged
        assert_eq!(counters.get_metric("meta").await.unwrap(), 0);
        assert_eq!(counters.get_metric("system").await.unwrap(), 0);
        assert!(notifier.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_counter_exactly_at_the_limit_still_admits() {
        let counters = Arc::new(MemoryCounters::new());
        counters.add_metric_cost("alice", 1024).await.unwrap();
        let engine = engine(
            r#"{"users": {"alice": "1K"}}"#,
            counters.clone(),
            Arc::new(CapturingNotifier::default()),
        );

        engine
            .check("meta", &Identity::new("alice"), 512.0)
            .await
            .unwrap();
        // soft limit: the call went through and pushed the counter past it
        assert_eq!(counters.get_metric("alice").await.unwrap(), 1536);
    }

    #[tokio::test]
    async fn over_the_limit_rejects_without_charging() {
        let counters = Arc::new(MemoryCounters::new());
        counters.add_metric_cost("alice", 1025).await.unwrap();
        let notifier = Arc::new(CapturingNotifier::default());
        let engine = engine(
            r#"{"users": {"alice": "1K"}}"#,
            counters.clone(),
            notifier.clone(),
        );

        let err = engine
            .check("meta", &Identity::new("alice"), 10.0)
            .await
            .unwrap_err();

        match err {
            Error::Throttled { tier, detail, retry_after } => {
                assert_eq!(tier, Tier::User);
                assert_eq!(detail, "User is throttled. Expected available tomorrow.");
                assert_eq!(retry_after, 86400);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(counters.get_metric("alice").await.unwrap(), 1025);

        let events = notifier.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (subject, message) = &events[0];
        assert_eq!(subject, "Request Throttled");
        assert!(message.starts_with("Throttling user 'alice': "));
        let body: serde_json::Value =
            serde_json::from_str(message.splitn(2, ": ").nth(1).unwrap()).unwrap();
        assert_eq!(body["current_metric"], 1025);
        assert_eq!(body["max_metric"], 1024);
        assert_eq!(body["fqdn"], "api.example.org");
    }

    #[tokio::test]
    async fn fractional_costs_charge_the_truncated_amount() {
        let counters = Arc::new(MemoryCounters::new());
        let engine = engine(
            r#"{"users": {"alice": "1K"}}"#,
            counters.clone(),
            Arc::new(CapturingNotifier::default()),
        );

        engine
            .check("meta", &Identity::new("alice"), 2.9)
            .await
            .unwrap();
        assert_eq!(counters.get_metric("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn api_violation_leaves_the_system_counter_untouched() {
        let counters = Arc::new(MemoryCounters::new());
        counters.add_metric_cost("meta", 2048).await.unwrap();
        let engine = engine(
            r#"{"users": {"alice": "10K"}, "apis": {"meta": "1K"}, "system": "100K"}"#,
            counters.clone(),
            Arc::new(CapturingNotifier::default()),
        );

        let err = engine
            .check("meta", &Identity::new("alice"), 10.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Throttled { tier: Tier::Api, .. }));

        // the user tier passed first and was charged; system was never reached
        assert_eq!(counters.get_metric("alice").await.unwrap(), 10);
        assert_eq!(counters.get_metric("system").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unbounded_tiers_are_read_but_never_charged() {
        let counters = Arc::new(ProbeCounters::default());
        let engine = engine("{}", counters.clone(), Arc::new(CapturingNotifier::default()));

        engine
            .check("meta", &Identity::new("alice"), 50.0)
            .await
            .unwrap();

        let reads = counters.reads.lock().unwrap().clone();
        assert_eq!(reads, vec!["alice", "meta", "system"]);
        assert_eq!(counters.inner.get_metric("alice").await.unwrap(), 0);
        assert_eq!(counters.inner.get_metric("meta").await.unwrap(), 0);
        assert_eq!(counters.inner.get_metric("system").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_change_the_decision() {
        let counters = Arc::new(MemoryCounters::new());
        counters.add_metric_cost("system", 200_000_000).await.unwrap();
        let engine = engine(
            r#"{"system": "100M"}"#,
            counters.clone(),
            Arc::new(FailingNotifier),
        );

        let err = engine
            .check("meta", &Identity::new("alice"), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Throttled { tier: Tier::System, .. }));
    }

    #[tokio::test]
    async fn counter_store_failure_is_not_reported_as_throttling() {
        let engine = engine(
            r#"{"system": "100M"}"#,
            Arc::new(DeadCounters),
            Arc::new(CapturingNotifier::default()),
        );

        let err = engine
            .check("meta", &Identity::new("alice"), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn usage_reports_all_tiers_without_charging() {
        let counters = Arc::new(MemoryCounters::new());
        counters.add_metric_cost("alice", 512).await.unwrap();
        let engine = engine(
            r#"{"users": {"alice": "1K"}, "apis": {"meta": "1M"}}"#,
            counters.clone(),
            Arc::new(CapturingNotifier::default()),
        );

        let report = engine.usage("meta", &Identity::new("alice")).await.unwrap();
        assert_eq!(report.len(), 3);

        assert_eq!(report[0].entity, "alice");
        assert_eq!(report[0].current, 512);
        assert_eq!(report[0].limit, ByteLimit::Bytes(1024));

        assert_eq!(report[1].entity, "meta");
        assert_eq!(report[1].limit, ByteLimit::Bytes(1 << 20));

        assert_eq!(report[2].entity, "system");
        assert_eq!(report[2].limit, ByteLimit::Unbounded);

        // usage is a pure read
        assert_eq!(counters.get_metric("alice").await.unwrap(), 512);
    }
}
