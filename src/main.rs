use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use metagate::config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Usage throttling and hierarchical metadata addressing service.
#[derive(Debug, Parser)]
#[command(name = "metagate", version, about)]
struct Args {
    /// Bind address (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Redis URL; pass an empty string for in-process backends
    /// (overrides REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Path to a throttle limits document (overrides THROTTLE_LIMITS_FILE)
    #[arg(long)]
    limits_file: Option<PathBuf>,

    /// Path to a hierarchy seed document (overrides DIRECTORY_SEED)
    #[arg(long)]
    directory_seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(limits_file) = args.limits_file {
        config.limits_file = Some(limits_file);
    }
    if let Some(seed) = args.directory_seed {
        config.directory_seed = Some(seed);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("metagate={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting metagate service");
    tracing::info!(
        "Configuration: bind_addr={}, backends={}",
        config.bind_addr,
        if config.memory_mode() {
            "in-process"
        } else {
            config.redis_url.as_str()
        }
    );

    metagate::server::run(config)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
