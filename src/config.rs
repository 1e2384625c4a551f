use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_NOTIFY_CHANNEL: &str = "throttle-events";
const DEFAULT_WINDOW: &str = "24h";

/// Runtime configuration, read once at startup.
///
/// Everything comes from the environment (`.env` friendly); the binary
/// layers its CLI flags on top of the parsed struct. An empty
/// `REDIS_URL` selects the in-process backends instead of redis.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (`BIND_ADDR`)
    pub bind_addr: SocketAddr,

    /// Redis connection URL (`REDIS_URL`); empty string = memory mode
    pub redis_url: String,

    /// Inline throttle limits document (`THROTTLE_LIMITS`, JSON)
    pub limits_json: Option<String>,

    /// Path to a throttle limits document (`THROTTLE_LIMITS_FILE`)
    pub limits_file: Option<PathBuf>,

    /// Channel throttle notifications are published on (`NOTIFY_CHANNEL`)
    pub notify_channel: String,

    /// Accounting window, humantime format (`THROTTLE_WINDOW`, e.g. "24h").
    /// Counters are reset on this cadence by an external job; the value
    /// only feeds `Retry-After` and the usage report.
    pub throttle_window: Duration,

    /// Host name reported in throttle notifications (`FQDN`)
    pub fqdn: String,

    /// Optional hierarchy seed document for memory mode (`DIRECTORY_SEED`)
    pub directory_seed: Option<PathBuf>,

    /// Log level for the crate's own spans (`LOG_LEVEL`)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("invalid BIND_ADDR: {}", e)))?;

        let throttle_window = parse_window(
            &env::var("THROTTLE_WINDOW").unwrap_or_else(|_| DEFAULT_WINDOW.to_string()),
        )?;

        Ok(Self {
            bind_addr,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            limits_json: optional_var("THROTTLE_LIMITS"),
            limits_file: optional_var("THROTTLE_LIMITS_FILE").map(PathBuf::from),
            notify_channel: env::var("NOTIFY_CHANNEL")
                .unwrap_or_else(|_| DEFAULT_NOTIFY_CHANNEL.to_string()),
            throttle_window,
            fqdn: env::var("FQDN").unwrap_or_else(|_| "localhost".to_string()),
            directory_seed: optional_var("DIRECTORY_SEED").map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// The limits document as a JSON string, inline value winning over
    /// the file path. `None` means no limits are configured and every
    /// tier is unbounded.
    pub fn limits_document(&self) -> Result<Option<String>> {
        if let Some(json) = &self.limits_json {
            return Ok(Some(json.clone()));
        }
        match &self.limits_file {
            Some(path) => {
                let doc = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read limits file {}: {}", path.display(), e))
                })?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Whether the in-process backends should be used instead of redis.
    pub fn memory_mode(&self) -> bool {
        self.redis_url.is_empty()
    }

    /// Seconds until the next counter reset, as advertised in
    /// `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        self.throttle_window.as_secs()
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a humantime duration string ("24h", "90m", "1day").
pub fn parse_window(value: &str) -> Result<Duration> {
    #[derive(Deserialize)]
    struct Window(#[serde(with = "humantime_serde")] Duration);

    let Window(window) = serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| Error::Config(format!("invalid THROTTLE_WINDOW '{}'", value)))?;
    Ok(window)
}
