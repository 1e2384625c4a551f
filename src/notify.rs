use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::Result;

/// Outbound alerting for throttle events. Publishing is best-effort:
/// the engine logs and swallows failures, so implementations never
/// influence admission decisions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, subject: &str, message: &str) -> Result<()>;
}

fn payload(subject: &str, message: &str) -> String {
    serde_json::json!({ "subject": subject, "message": message }).to_string()
}

/// Publishes throttle events on a redis pub/sub channel for whatever
/// alerting pipeline is subscribed.
pub struct RedisNotifier {
    conn: MultiplexedConnection,
    channel: String,
}

impl RedisNotifier {
    pub fn new(conn: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(&self, subject: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(&self.channel, payload(subject, message))
            .await?;
        Ok(())
    }
}

/// Memory-mode fallback: throttle events go to the log instead of a
/// channel.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, subject: &str, message: &str) -> Result<()> {
        warn!(subject, "{}", message);
        Ok(())
    }
}
