use std::sync::Arc;

use axum::routing::{get, MethodRouter};
use axum::{middleware, Router};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::counters::{CounterStore, MemoryCounters, RedisCounters};
use crate::directory::{Directory, MemoryDirectory};
use crate::error::{Error, Result};
use crate::handlers::{
    delete_meta, get_meta, health, post_meta, put_meta, throttle_usage, AppState, SharedState,
};
use crate::hierarchy::Resolver;
use crate::limits::LimitSet;
use crate::metadb::{MemoryMetaStore, MetaDb, MetadataStore, RedisMetaStore};
use crate::middleware::logging_middleware;
use crate::notify::{LogNotifier, Notifier, RedisNotifier};
use crate::throttle::ThrottleEngine;

/// Wire the backends and build the shared state. A non-empty
/// `REDIS_URL` selects redis for counters, metadata, and
/// notifications; the empty string runs everything in-process.
pub async fn build_state(config: &Config) -> Result<SharedState> {
    let limits = match config.limits_document()? {
        Some(doc) => LimitSet::from_json(&doc)?,
        None => LimitSet::empty(),
    };

    let (counters, store, notifier): (
        Arc<dyn CounterStore>,
        Arc<dyn MetadataStore>,
        Arc<dyn Notifier>,
    ) = if config.memory_mode() {
        info!("REDIS_URL is empty, using in-process backends");
        (
            Arc::new(MemoryCounters::new()),
            Arc::new(MemoryMetaStore::new()),
            Arc::new(LogNotifier),
        )
    } else {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        (
            Arc::new(RedisCounters::new(conn.clone())),
            Arc::new(RedisMetaStore::new(conn.clone())),
            Arc::new(RedisNotifier::new(conn, config.notify_channel.clone())),
        )
    };

    let directory: Arc<dyn Directory> = match &config.directory_seed {
        Some(path) => {
            let doc = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!(
                    "cannot read directory seed {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Arc::new(MemoryDirectory::from_json(&doc)?)
        }
        None => Arc::new(MemoryDirectory::new()),
    };

    let engine = ThrottleEngine::new(
        limits,
        counters.clone(),
        notifier,
        config.fqdn.clone(),
        config.retry_after_secs(),
    );

    Ok(Arc::new(AppState {
        engine,
        resolver: Resolver::new(directory),
        metadb: MetaDb::new(store),
        counters,
        window: config.throttle_window,
    }))
}

fn meta_routes() -> MethodRouter<SharedState> {
    get(get_meta)
        .post(post_meta)
        .put(put_meta)
        .delete(delete_meta)
}

/// Assemble the router with tracing, CORS, and request logging.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/meta/:collection", meta_routes())
        .route("/meta/:collection/:experiment", meta_routes())
        .route("/meta/:collection/:experiment/:dataset", meta_routes())
        .route(
            "/meta/:collection/:experiment/:dataset/:channel",
            meta_routes(),
        )
        .route("/health", get(health))
        .route("/throttle/usage", get(throttle_usage))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub async fn run(config: Config) -> Result<()> {
    let state = build_state(&config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("metagate listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
