use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{Error, Result};

/// Counter keys are the entity name plus this suffix, shared with the
/// external reset job.
const METRIC_SUFFIX: &str = "_metric";

fn metric_key(entity: &str) -> String {
    format!("{}{}", entity, METRIC_SUFFIX)
}

/// Usage counters, one per throttled entity (user name, API name, or
/// the literal `system`). Resets happen outside this service on the
/// accounting window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current counter value; a missing counter reads as zero.
    async fn get_metric(&self, entity: &str) -> Result<u64>;

    /// Atomically add a cost to an entity's counter.
    async fn add_metric_cost(&self, entity: &str, cost: u64) -> Result<()>;

    /// Backend reachability, for health reporting.
    async fn ping(&self) -> Result<()>;
}

/// Redis-backed counters: `GET` / `INCRBY` on `<entity>_metric` keys.
pub struct RedisCounters {
    conn: MultiplexedConnection,
}

impl RedisCounters {
    /// The connection is multiplexed and cheap to clone, so the server
    /// opens one and hands clones to every adapter.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn get_metric(&self, entity: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(metric_key(entity)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn add_metric_cost(&self, entity: &str, cost: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.incr(metric_key(entity), cost).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process counters for memory mode and tests.
#[derive(Default)]
pub struct MemoryCounters {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn get_metric(&self, entity: &str) -> Result<u64> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| Error::Store("counter table lock poisoned".to_string()))?;
        Ok(counters.get(&metric_key(entity)).copied().unwrap_or(0))
    }

    async fn add_metric_cost(&self, entity: &str, cost: u64) -> Result<()> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| Error::Store("counter table lock poisoned".to_string()))?;
        *counters.entry(metric_key(entity)).or_insert(0) += cost;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
