//! Service layer types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::Prediction;
use crate::error::{ErrorKind, PredictionError};

use super::map::MapMarker;

/// Per-request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Received,
    Decoded,
    Staged,
    Predicted,
    Cleaned,
    Failed(ErrorKind),
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Cleaned | RequestState::Failed(_))
    }
}

/// Ordered record of the states one request went through
#[derive(Debug, Clone)]
pub struct Lifecycle {
    request_id: String,
    states: Vec<RequestState>,
}

impl Lifecycle {
    pub fn new(request_id: String) -> Self {
        debug!("[{}] {:?}", request_id, RequestState::Received);
        Self {
            request_id,
            states: vec![RequestState::Received],
        }
    }

    pub fn advance(&mut self, state: RequestState) {
        if self.current().is_terminal() {
            return;
        }
        debug!("[{}] {:?}", self.request_id, state);
        self.states.push(state);
    }

    pub fn current(&self) -> RequestState {
        self.states
            .last()
            .copied()
            .unwrap_or(RequestState::Received)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn into_states(self) -> Vec<RequestState> {
        self.states
    }
}

/// Result of one `submit` call: predictions on success, a classified error otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub request_id: String,
    pub predictions: Vec<Prediction>,
    pub error: Option<PredictionError>,
    pub marker: Option<MapMarker>,
    pub lifecycle: Vec<RequestState>,
    pub inference_time_ms: u64,
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Highest-probability prediction, if any
    pub fn best(&self) -> Option<&Prediction> {
        self.predictions.first()
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub version: String,
    pub model_loaded: bool,
    pub model_constructions: usize,
}

/// Request counters since startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: HashMap<ErrorKind, u64>,
}

impl ServiceStats {
    pub fn record(&mut self, outcome: &SubmitOutcome) {
        self.requests += 1;
        match &outcome.error {
            None => self.successes += 1,
            Some(error) => *self.failures.entry(error.kind).or_insert(0) += 1,
        }
    }
}
