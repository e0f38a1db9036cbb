//! HTTP server for bundle cache endpoints
//!
//! Provides /health, /resolve, /render-url, /cache/size and DELETE /cache.

use crate::error::ApiError;
use crate::types::{
    HealthResponse, RenderUrlResponse, ResolveQuery, ResolveResponse, SizeResponse,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use bundle_cache::ResourceCache;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: ResourceCache,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: ResourceCache) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/resolve", get(resolve))
        .route("/render-url", get(render_url))
        .route("/cache/size", get(cache_size))
        .route("/cache", axum::routing::delete(clear_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache_stats = state.cache.stats().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache_stats,
    })
}

/// Resolve a bundle URL to its cached local file
async fn resolve(
    State(state): State<SharedState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let resolved = state.cache.resolve(&query.url).await.map_err(|e| {
        warn!(url = %query.url, error = %e, "Failed to resolve bundle");
        e
    })?;

    Ok(Json(ResolveResponse {
        request_url: query.url,
        render_url: resolved.uri.to_string(),
        path: resolved.path.display().to_string(),
        size: resolved.size,
        cached: resolved.from_cache,
    }))
}

/// URL the client should render from, falling back to the remote URL
async fn render_url(
    State(state): State<SharedState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<RenderUrlResponse>, ApiError> {
    let url = state.cache.render_url(&query.url).await?;
    Ok(Json(RenderUrlResponse {
        render_url: url.to_string(),
    }))
}

async fn cache_size(State(state): State<SharedState>) -> Json<SizeResponse> {
    Json(SizeResponse {
        total_size: state.cache.aggregate_size().await,
    })
}

async fn clear_cache(State(state): State<SharedState>) -> Result<StatusCode, ApiError> {
    state.cache.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}
