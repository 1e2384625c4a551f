use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::throttle::Tier;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Business-rule failures (throttling, hierarchy misses, metadata
/// conflicts) get distinct variants so the HTTP boundary can map them to
/// structured responses; infrastructure failures from the counter,
/// directory, or metadata stores pass through as `Store` and are never
/// converted into business outcomes.
#[derive(Debug, Error)]
pub enum Error {
    /// An unparseable limit string in the throttle configuration.
    /// Raised while loading limits, which aborts engine construction.
    #[error("malformed limit: {0}")]
    MalformedLimit(String),

    /// The call was rejected by the named throttle tier.
    #[error("{detail}")]
    Throttled {
        tier: Tier,
        detail: String,
        retry_after: u64,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Backend store failure (redis, directory, metadata).
    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::MalformedLimit(msg) => Self::new("malformed_limit", msg, 500),
            Error::Throttled { detail, .. } => Self::new("throttled", detail, 429),
            Error::NotFound(msg) => Self::new("not_found", msg, 404),
            Error::InvalidArgument(msg) => Self::new("invalid_argument", msg, 400),
            Error::AlreadyExists(msg) => Self::new("already_exists", msg, 409),
            Error::Store(msg) => Self::new("service_unavailable", msg, 503),
            Error::Config(msg) => Self::new("configuration_error", msg, 500),
            Error::Io(err) => Self::new("internal_error", &err.to_string(), 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(body)).into_response();

        if let Error::Throttled { retry_after, .. } = self {
            if let Ok(value) = header::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
