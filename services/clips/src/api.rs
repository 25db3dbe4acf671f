use crate::clip_store::{self, CatalogStats, Clip, ClipQuery, ClipStats, NewClip, PgDriver};
use crate::config::{ApiConfig, Config};
use crate::error::ServiceError;
use crate::middleware::{enforce_rate_limit, observe_requests, RateLimitGate, RequestObserver};
use crate::observability::RequestMetrics;
use crate::rate_limiter::RateLimiter;
use crate::store_manager::{StoreManager, StoreStatus};
use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Maximum page size for clip listings
const MAX_LIST_LIMIT: i64 = 500;

/// Maximum number of popular clips returned
const MAX_POPULAR_LIMIT: i64 = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StoreManager<PgDriver>>,
    pub metrics: Arc<RequestMetrics>,
    pub limiter: Arc<RateLimiter>,
    pub prometheus: Option<PrometheusHandle>,
    pub service: Arc<ServiceInfo>,
}

/// Static facts about this deployment
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: &'static str,
    pub environment: String,
    /// Connection descriptor with credentials redacted
    pub database: String,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<StoreManager<PgDriver>>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            store,
            metrics: Arc::new(RequestMetrics::new()),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            prometheus,
            service: Arc::new(ServiceInfo {
                name: config.service.name.clone(),
                version: env!("CARGO_PKG_VERSION"),
                environment: config.service.environment.clone(),
                database: config.database.redacted_url(),
            }),
        }
    }
}

/// Query parameters for clip listing
#[derive(Debug, Deserialize)]
pub struct ClipListQuery {
    /// Number of clips to skip
    #[serde(default)]
    pub skip: i64,
    /// Maximum clips to return
    #[serde(default = "default_list_limit")]
    pub limit: i64,
    /// Filter by genre (case-insensitive)
    pub genre: Option<String>,
}

fn default_list_limit() -> i64 {
    100
}

/// Query parameters for popular clips
#[derive(Debug, Deserialize)]
pub struct PopularQuery {
    #[serde(default = "default_popular_limit")]
    pub limit: i64,
}

fn default_popular_limit() -> i64 {
    5
}

/// Catalog statistics response
#[derive(Debug, Serialize)]
pub struct CatalogStatsResponse {
    #[serde(flatten)]
    pub stats: CatalogStats,
    pub environment: String,
    pub timestamp: f64,
}

/// Create the API router
pub fn create_router(state: AppState, config: &Config) -> Router {
    let observer = RequestObserver::new(state.metrics.clone(), &config.api.deployment_headers);

    let clip_routes = Router::new()
        .route("/clips", get(list_clips).post(create_clip))
        .route("/clips/popular", get(popular_clips))
        .route("/clips/:clip_id/stream", get(stream_clip))
        .route("/clips/:clip_id/stats", get(clip_stats))
        .route("/stats", get(catalog_stats));

    let clip_routes = if config.rate_limit.enabled {
        let gate = RateLimitGate::from_config(state.limiter.clone(), &config.rate_limit);
        clip_routes.route_layer(axum::middleware::from_fn_with_state(gate, enforce_rate_limit))
    } else {
        clip_routes
    };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(render_metrics))
        .merge(clip_routes)
        .fallback(route_not_found)
        .with_state(state)
        .layer(cors_layer(&config.api))
        .layer(TraceLayer::new_for_http())
        // Outermost, so preflights and built-in rejections are observed too.
        .layer(axum::middleware::from_fn_with_state(observer, observe_requests))
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    if !config.cors_enabled {
        return CorsLayer::new();
    }

    if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Service information and endpoint map
async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Clips API - Audio streaming service",
        "service": state.service.name,
        "version": state.service.version,
        "environment": state.service.environment,
        "endpoints": {
            "health": "/health",
            "ready": "/ready",
            "metrics": "/metrics",
            "clips": "/clips",
            "popular": "/clips/popular",
            "stream": "/clips/{id}/stream",
            "stats": "/clips/{id}/stats",
            "catalog_stats": "/stats"
        }
    }))
}

/// Health check including store connectivity and catalog totals
async fn health_check(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ServiceError> {
    let mut db = state.store.acquire().await?;
    let stats = clip_store::catalog_stats(&mut db).await?;
    drop(db);
    let store = state.store.stats();

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": unix_timestamp(),
        "service": state.service.name,
        "environment": state.service.environment,
        "database": {
            "status": "connected",
            "url": state.service.database,
        },
        "stats": {
            "total_clips": stats.total_clips,
            "total_plays": stats.total_plays,
        },
        "store": {
            "attempts": store.attempts,
            "failures": store.failures,
            "acquired": store.acquired,
            "released": store.released,
        },
    })))
}

/// Readiness check: can a live handle be acquired right now
async fn readiness_check(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ServiceError> {
    let db = state.store.acquire().await?;
    let held_ms = db.held_for().as_millis() as u64;
    drop(db);

    let store = match state.store.status() {
        StoreStatus::Ready => "ready",
        StoreStatus::Uninitialized => "uninitialized",
        StoreStatus::Degraded { .. } => "degraded",
    };

    Ok(Json(serde_json::json!({
        "status": "ready",
        "store": store,
        "probe_ms": held_ms,
    })))
}

/// Prometheus text exposition
async fn render_metrics(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ServiceError> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or_else(|| ServiceError::NotFound("Metrics exporter is not installed".to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}

/// List clips with pagination and optional genre filter
#[instrument(skip(state, params))]
async fn list_clips(
    State(state): State<AppState>,
    params: Result<Query<ClipListQuery>, QueryRejection>,
) -> Result<Json<Vec<Clip>>, ServiceError> {
    let Query(params) = params.map_err(|e| ServiceError::BadRequest(e.body_text()))?;

    if params.skip < 0 {
        return Err(ServiceError::BadRequest(
            "skip must not be negative".to_string(),
        ));
    }
    if !(1..=MAX_LIST_LIMIT).contains(&params.limit) {
        return Err(ServiceError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }

    let query = ClipQuery {
        skip: params.skip,
        limit: params.limit,
        genre: params.genre.filter(|g| !g.trim().is_empty()),
    };

    let mut db = state.store.acquire().await?;
    let clips = clip_store::list_clips(&mut db, &query).await?;

    info!(count = clips.len(), genre = ?query.genre, "Retrieved clips");

    Ok(Json(clips))
}

/// Create a new clip
#[instrument(skip(state, body))]
async fn create_clip(
    State(state): State<AppState>,
    body: Result<Json<NewClip>, JsonRejection>,
) -> Result<Json<Clip>, ServiceError> {
    let Json(new_clip) = body.map_err(|e| ServiceError::BadRequest(e.body_text()))?;
    new_clip.validate().map_err(ServiceError::BadRequest)?;

    let mut db = state.store.acquire().await?;
    let clip = clip_store::create_clip(&mut db, &new_clip).await?;

    info!(
        clip_id = clip.id,
        title = %clip.title,
        genre = %clip.genre,
        "Created new clip"
    );

    Ok(Json(clip))
}

/// Most played clips
async fn popular_clips(
    State(state): State<AppState>,
    params: Result<Query<PopularQuery>, QueryRejection>,
) -> Result<Json<Vec<Clip>>, ServiceError> {
    let Query(params) = params.map_err(|e| ServiceError::BadRequest(e.body_text()))?;
    let limit = params.limit.clamp(1, MAX_POPULAR_LIMIT);

    let mut db = state.store.acquire().await?;
    let clips = clip_store::popular_clips(&mut db, limit).await?;

    Ok(Json(clips))
}

/// Record a play and redirect to the audio
#[instrument(skip(state, clip_id))]
async fn stream_clip(
    State(state): State<AppState>,
    clip_id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Path(clip_id) = clip_id.map_err(|e| ServiceError::BadRequest(e.body_text()))?;

    let mut db = state.store.acquire().await?;
    let clip = clip_store::record_play(&mut db, clip_id)
        .await?
        .ok_or_else(|| clip_not_found(clip_id))?;

    state.metrics.record_stream(clip.id);

    info!(
        clip_id = clip.id,
        title = %clip.title,
        plays = clip.play_count,
        "Streaming clip"
    );

    Ok((StatusCode::FOUND, [(header::LOCATION, clip.audio_url)]))
}

/// Play statistics for one clip
async fn clip_stats(
    State(state): State<AppState>,
    clip_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<ClipStats>, ServiceError> {
    let Path(clip_id) = clip_id.map_err(|e| ServiceError::BadRequest(e.body_text()))?;

    let mut db = state.store.acquire().await?;
    let clip = clip_store::get_clip(&mut db, clip_id)
        .await?
        .ok_or_else(|| clip_not_found(clip_id))?;

    Ok(Json(clip.into()))
}

/// Catalog-wide statistics
async fn catalog_stats(
    State(state): State<AppState>,
) -> Result<Json<CatalogStatsResponse>, ServiceError> {
    let mut db = state.store.acquire().await?;
    let stats = clip_store::catalog_stats(&mut db).await?;

    Ok(Json(CatalogStatsResponse {
        stats,
        environment: state.service.environment.clone(),
        timestamp: unix_timestamp(),
    }))
}

async fn route_not_found(uri: Uri) -> ServiceError {
    ServiceError::NotFound(format!("No route for {}", uri.path()))
}

fn clip_not_found(clip_id: i64) -> ServiceError {
    ServiceError::NotFound(format!("Clip with id {clip_id} not found"))
}

fn unix_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.api.host, config.api.port);

    info!(address = %addr, "Starting clips API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("API server error")?;

    Ok(())
}
