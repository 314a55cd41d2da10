//! Prediction service
//!
//! Runs the model on a staged file inside a call-scoped inference session and
//! normalizes whatever the model returns into exactly `top_k` ranked
//! [`Prediction`]s.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::cache::ModelHandle;
use crate::engine::model::{RawCoordinates, RawPrediction, RawScores};
use crate::engine::staging::StagedFile;
use crate::error::{ModelFault, PipelineFault};
use crate::utils::math::{all_finite, clamp_latitude, clamp_probability, softmax, wrap_longitude};

/// One ranked coordinate candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub latitude: f64,
    pub longitude: f64,
    pub probability: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionService;

impl PredictionService {
    pub fn new() -> Self {
        Self
    }

    /// Predict `top_k` (>= 1) ranked coordinates for the staged image
    pub fn predict(
        &self,
        staged: &StagedFile,
        top_k: usize,
        handle: &ModelHandle,
    ) -> Result<Vec<Prediction>, PipelineFault> {
        let top_k = top_k.max(1);
        let start = Instant::now();

        // The session (and the no-grad scope with it) ends with this statement
        let raw = handle
            .session()
            .predict(staged.path(), top_k)
            .map_err(PipelineFault::Inference)?;

        debug!("Model answered in {:?}", start.elapsed());
        normalize(raw, top_k).map_err(PipelineFault::Inference)
    }
}

/// Canonicalize raw model output: clamp into valid ranges, sort by descending
/// probability and truncate or pad to exactly `top_k` entries.
///
/// Padding repeats the lowest-ranked coordinate with probability 0.
pub fn normalize(raw: RawPrediction, top_k: usize) -> Result<Vec<Prediction>, ModelFault> {
    let coordinates = coordinate_pairs(raw.coordinates)?;
    let probabilities = match (raw.probabilities, raw.logits) {
        (Some(scores), _) => flatten_scores(scores)?,
        (None, Some(logits)) => softmax(&flatten_scores(logits)?),
        (None, None) => {
            return Err(ModelFault::InterfaceShape(
                "response carries neither probabilities nor logits".into(),
            ))
        }
    };

    if coordinates.len() != probabilities.len() {
        return Err(ModelFault::InterfaceShape(format!(
            "{} coordinates but {} probabilities",
            coordinates.len(),
            probabilities.len()
        )));
    }
    if coordinates.is_empty() {
        return Err(ModelFault::InterfaceShape("model returned no candidates".into()));
    }
    if !all_finite(&probabilities) {
        return Err(ModelFault::InterfaceShape("non-finite probability".into()));
    }

    let mut predictions: Vec<Prediction> = coordinates
        .into_iter()
        .zip(probabilities)
        .map(|((lat, lon), p)| Prediction {
            latitude: clamp_latitude(lat),
            longitude: wrap_longitude(lon),
            probability: clamp_probability(p),
        })
        .collect();

    predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    predictions.truncate(top_k);

    if let Some(last) = predictions.last().copied() {
        predictions.resize(
            top_k,
            Prediction {
                probability: 0.0,
                ..last
            },
        );
    }

    Ok(predictions)
}

fn coordinate_pairs(raw: RawCoordinates) -> Result<Vec<(f64, f64)>, ModelFault> {
    let pairs: Vec<(f64, f64)> = match raw {
        RawCoordinates::Pairs(rows) => rows
            .into_iter()
            .map(|row| match row.as_slice() {
                [lat, lon] => Ok((*lat, *lon)),
                other => Err(ModelFault::InterfaceShape(format!(
                    "coordinate row has {} values, expected 2",
                    other.len()
                ))),
            })
            .collect::<Result<_, _>>()?,
        RawCoordinates::Flat(values) => {
            if values.len() % 2 != 0 {
                return Err(ModelFault::InterfaceShape(format!(
                    "flat coordinate list has odd length {}",
                    values.len()
                )));
            }
            values.chunks_exact(2).map(|c| (c[0], c[1])).collect()
        }
    };

    if pairs.iter().any(|(lat, lon)| !lat.is_finite() || !lon.is_finite()) {
        return Err(ModelFault::InterfaceShape("non-finite coordinate".into()));
    }
    Ok(pairs)
}

fn flatten_scores(scores: RawScores) -> Result<Vec<f64>, ModelFault> {
    match scores {
        RawScores::Flat(values) => Ok(values),
        RawScores::Nested(rows) => rows
            .into_iter()
            .map(|row| match row.as_slice() {
                [value] => Ok(*value),
                other => Err(ModelFault::InterfaceShape(format!(
                    "score row has {} values, expected 1",
                    other.len()
                ))),
            })
            .collect(),
    }
}
