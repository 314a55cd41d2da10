//! REST API request/response data transfer objects

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::Prediction;
use crate::error::{PredictionError, Surface};
use crate::service::{MapMarker, RequestState, SubmitOutcome};

/// Locate query parameters (image arrives as multipart form field `image`)
#[derive(Debug, Deserialize)]
pub struct LocateQuery {
    pub top_k: Option<usize>,
}

/// Locate response
#[derive(Debug, Serialize, Deserialize)]
pub struct LocateResponse {
    pub request_id: String,
    pub predictions: Vec<PredictionDto>,
    pub error: Option<PredictionErrorDto>,
    pub marker: Option<MarkerDto>,
    pub lifecycle: Vec<RequestState>,
    pub inference_time_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionDto {
    pub latitude: f64,
    pub longitude: f64,
    pub probability: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionErrorDto {
    pub kind: String,
    pub message: Option<String>,
    pub hint: String,
    pub surface: Surface,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkerDto {
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
    pub caption: String,
    pub zoom: u8,
    pub url: String,
}

impl From<Prediction> for PredictionDto {
    fn from(p: Prediction) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
            probability: p.probability,
        }
    }
}

impl From<PredictionError> for PredictionErrorDto {
    fn from(e: PredictionError) -> Self {
        Self {
            kind: e.kind.as_str().to_string(),
            message: e.message,
            hint: e.hint,
            surface: e.surface,
        }
    }
}

impl From<MapMarker> for MarkerDto {
    fn from(m: MapMarker) -> Self {
        Self {
            latitude: m.latitude,
            longitude: m.longitude,
            label: m.label,
            caption: m.caption,
            zoom: m.zoom,
            url: m.url,
        }
    }
}

impl From<SubmitOutcome> for LocateResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            predictions: outcome.predictions.into_iter().map(Into::into).collect(),
            error: outcome.error.map(Into::into),
            marker: outcome.marker.map(Into::into),
            lifecycle: outcome.lifecycle,
            inference_time_ms: outcome.inference_time_ms,
        }
    }
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub model_loaded: bool,
    pub model_constructions: usize,
}

/// Metrics response
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub requests: u64,
    pub successes: u64,
    pub failures: HashMap<String, u64>,
    pub model_loaded: bool,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}
