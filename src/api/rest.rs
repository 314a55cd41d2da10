//! Axum REST API handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ErrorKind;
use crate::service::LocateService;

use super::dto::*;

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<LocateService>,
    pub start_time: Instant,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    let body_limit = state.service.config().server.max_upload_bytes;

    Router::new()
        .route("/api/v1/locate", post(locate_handler))
        // System endpoints
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: &str, code: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message, code)))
}

/// HTTP status for a classified pipeline failure
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::DecodeFailure => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ModelLoadFailure | ErrorKind::ResourceExhaustion => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::StagingFailure
        | ErrorKind::VersionIncompatibility
        | ErrorKind::UnclassifiedFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Locate a photo
async fn locate_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocateQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<LocateResponse>), ApiError> {
    let max_top_k = state.service.config().inference.max_top_k;
    if let Some(top_k) = query.top_k {
        if top_k == 0 || top_k > max_top_k {
            return Err(bad_request(
                &format!("top_k must be between 1 and {}", max_top_k),
                "INVALID_TOP_K",
            ));
        }
    }

    let mut image_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&e.to_string(), "MULTIPART_ERROR"))?
    {
        if field.name() == Some("image") {
            image_data = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(&e.to_string(), "READ_ERROR"))?
                    .to_vec(),
            );
        }
    }

    let image_data = image_data.ok_or_else(|| bad_request("Missing image field", "MISSING_IMAGE"))?;

    let outcome = state.service.submit(image_data, query.top_k).await;
    let status = outcome
        .error
        .as_ref()
        .map(|e| status_for(e.kind))
        .unwrap_or(StatusCode::OK);

    Ok((status, Json(LocateResponse::from(outcome))))
}

/// Health check
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health();

    Json(HealthResponse {
        healthy: health.healthy,
        version: health.version,
        model_loaded: health.model_loaded,
        model_constructions: health.model_constructions,
    })
}

/// Metrics
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let health = state.service.health();
    let stats = state.service.stats();

    Json(MetricsResponse {
        requests: stats.requests,
        successes: stats.successes,
        failures: stats
            .failures
            .into_iter()
            .map(|(kind, count)| (kind.as_str().to_string(), count))
            .collect(),
        model_loaded: health.model_loaded,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
