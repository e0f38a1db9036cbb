//! Error types for the bundle cache server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bundle_cache::CacheError;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum ServerError {
    Cache(CacheError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Cache(err) => write!(f, "Cache error: {}", err),
            ServerError::Io(err) => write!(f, "IO error: {}", err),
            ServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Cache(err) => Some(err),
            ServerError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        ServerError::Cache(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// A cache failure returned from a route handler
#[derive(Debug)]
pub struct ApiError(pub CacheError);

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CacheError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CacheError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Http(_) | CacheError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            CacheError::Io(_) | CacheError::Manifest(_) | CacheError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Internal cache error");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
