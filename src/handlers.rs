use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use validator::Validate;

use crate::counters::CounterStore;
use crate::error::{Error, Result};
use crate::hierarchy::{HierarchyPath, HierarchyQuery, Resolver};
use crate::limits::Identity;
use crate::metadb::MetaDb;
use crate::response::{EntryResponse, HealthResponse, KeysResponse, UsageResponse};
use crate::throttle::ThrottleEngine;

/// API name the metadata endpoints are throttled under.
const META_API: &str = "meta";

const USER_HEADER: &str = "x-forwarded-user";
const GROUPS_HEADER: &str = "x-forwarded-groups";

/// Shared application state. Everything in here is immutable after
/// startup; limit changes require a restart.
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub engine: ThrottleEngine,
    pub resolver: Resolver,
    pub metadb: MetaDb,
    pub counters: Arc<dyn CounterStore>,
    pub window: Duration,
}

/// Query parameters accepted by the metadata routes.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct MetaParams {
    #[validate(length(min = 1, max = 255))]
    pub key: Option<String>,
    #[validate(length(max = 65536))]
    pub value: Option<String>,
    pub channel: Option<String>,
    pub time: Option<String>,
    pub layer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UsageParams {
    #[serde(default = "default_api")]
    pub api: String,
}

fn default_api() -> String {
    META_API.to_string()
}

/// The caller, as asserted by the front proxy. Absent headers mean the
/// anonymous identity, which is only limited if configured by name.
fn identity_from_headers(headers: &HeaderMap) -> Identity {
    let name = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|name| !name.is_empty());
    let Some(name) = name else {
        return Identity::anonymous();
    };

    let groups: Vec<String> = headers
        .get(GROUPS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|group| !group.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Identity::with_groups(name, groups)
}

/// Route parameters arrive as a name/value map; order them back into
/// path segments.
fn segments_from(params: &HashMap<String, String>) -> Vec<String> {
    ["collection", "experiment", "dataset", "channel"]
        .iter()
        .filter_map(|name| params.get(*name).cloned())
        .collect()
}

async fn resolve_path(
    state: &AppState,
    params: &HashMap<String, String>,
    query: &MetaParams,
) -> Result<HierarchyPath> {
    let request = HierarchyQuery {
        segments: segments_from(params),
        channel: query.channel.clone(),
        time: query.time.clone(),
        layer: query.layer.clone(),
        key: query.key.clone(),
        value: query.value.clone(),
    };
    let path = state.resolver.resolve(&request).await?;
    if path.lookup_key().is_empty() {
        return Err(Error::InvalidArgument(
            "could not resolve a lookup key from the request".to_string(),
        ));
    }
    Ok(path)
}

fn validated(query: MetaParams) -> Result<MetaParams> {
    query
        .validate()
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;
    Ok(query)
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::InvalidArgument(format!("missing required parameter '{}'", name)))
}

/// Writes are charged by payload size, reads per call.
fn write_cost(query: &MetaParams) -> f64 {
    query.value.as_ref().map(|value| value.len() as f64).unwrap_or(1.0)
}

/// Read one metadata entry, or list all keys when no `key` parameter
/// is supplied.
pub async fn get_meta(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<MetaParams>,
) -> Result<Response> {
    let identity = identity_from_headers(&headers);
    state.engine.check(META_API, &identity, 1.0).await?;
    let query = validated(query)?;
    let path = resolve_path(&state, &params, &query).await?;
    let lookup_key = path.lookup_key();

    match path.get_key() {
        None => {
            let keys = state.metadb.keys(&lookup_key).await?;
            Ok(Json(KeysResponse { keys }).into_response())
        }
        Some(key) => {
            let value = state.metadb.read(&lookup_key, key).await?;
            Ok(Json(EntryResponse::new(key, value)).into_response())
        }
    }
}

/// Create a metadata entry; refuses to overwrite.
pub async fn post_meta(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<MetaParams>,
) -> Result<impl IntoResponse> {
    let identity = identity_from_headers(&headers);
    state.engine.check(META_API, &identity, write_cost(&query)).await?;
    let query = validated(query)?;
    let path = resolve_path(&state, &params, &query).await?;

    let key = required(query.key.as_deref(), "key")?;
    let value = required(query.value.as_deref(), "value")?;
    state.metadb.create(&path.lookup_key(), key, value).await?;
    Ok((StatusCode::CREATED, Json(EntryResponse::new(key, value))))
}

/// Update an existing metadata entry.
pub async fn put_meta(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<MetaParams>,
) -> Result<impl IntoResponse> {
    let identity = identity_from_headers(&headers);
    state.engine.check(META_API, &identity, write_cost(&query)).await?;
    let query = validated(query)?;
    let path = resolve_path(&state, &params, &query).await?;

    let key = required(query.key.as_deref(), "key")?;
    let value = required(query.value.as_deref(), "value")?;
    state.metadb.update(&path.lookup_key(), key, value).await?;
    Ok(Json(EntryResponse::new(key, value)))
}

/// Delete a metadata entry.
pub async fn delete_meta(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<MetaParams>,
) -> Result<impl IntoResponse> {
    let identity = identity_from_headers(&headers);
    state.engine.check(META_API, &identity, 1.0).await?;
    let query = validated(query)?;
    let path = resolve_path(&state, &params, &query).await?;

    let key = required(query.key.as_deref(), "key")?;
    state.metadb.remove(&path.lookup_key(), key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Health check endpoint.
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    match state.counters.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse::healthy(true))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::unhealthy(false)),
        ),
    }
}

/// The calling identity's usage across all throttle tiers.
pub async fn throttle_usage(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<UsageParams>,
) -> Result<Json<UsageResponse>> {
    let identity = identity_from_headers(&headers);
    let report = state.engine.usage(&params.api, &identity).await?;
    Ok(Json(UsageResponse::new(state.window, report)))
}
