//! External geolocation model interface
//!
//! The model only accepts a path to an image file on disk, never an in-memory
//! buffer; everything in [`crate::engine::staging`] exists to satisfy that.

use std::cell::Cell;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ModelFault;

thread_local! {
    static NO_GRAD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether gradient tracking is on for the current thread
pub fn grad_enabled() -> bool {
    NO_GRAD_DEPTH.with(|depth| depth.get() == 0)
}

/// Gradient-free scope on the current thread, like `torch.no_grad()`.
///
/// Only [`crate::engine::cache::InferenceSession`] can enter one, so a model can
/// never be invoked outside a call-scoped no-grad region. Leaving the scope
/// restores the previous mode; nothing global is switched off for good.
#[derive(Debug)]
pub struct NoGrad {
    // Must be dropped on the thread that entered it
    _not_send: PhantomData<*const ()>,
}

impl NoGrad {
    pub(crate) fn enter() -> Self {
        NO_GRAD_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    pub fn grad_enabled(&self) -> bool {
        grad_enabled()
    }
}

impl Drop for NoGrad {
    fn drop(&mut self) {
        NO_GRAD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Probability payload as the model may return it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawScores {
    /// One probability per candidate
    Flat(Vec<f64>),
    /// Column vector, one single-element row per candidate
    Nested(Vec<Vec<f64>>),
}

/// Coordinate payload as the model may return it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawCoordinates {
    /// `[[lat, lon], ...]`
    Pairs(Vec<Vec<f64>>),
    /// `[lat, lon, lat, lon, ...]`
    Flat(Vec<f64>),
}

/// Unnormalized model output
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPrediction {
    pub coordinates: RawCoordinates,
    #[serde(default)]
    pub probabilities: Option<RawScores>,
    /// Unnormalized scores, used when `probabilities` is absent
    #[serde(default)]
    pub logits: Option<RawScores>,
}

impl RawPrediction {
    /// Build from already well-formed pairs and probabilities
    pub fn from_pairs(pairs: &[(f64, f64)], probabilities: &[f64]) -> Self {
        Self {
            coordinates: RawCoordinates::Pairs(pairs.iter().map(|&(lat, lon)| vec![lat, lon]).collect()),
            probabilities: Some(RawScores::Flat(probabilities.to_vec())),
            logits: None,
        }
    }
}

/// A loaded geolocation model
pub trait GeoModel: Send + Sync {
    /// Rank the `top_k` most likely coordinates for the image stored at `image_path`
    fn predict(
        &self,
        image_path: &Path,
        top_k: usize,
        scope: &NoGrad,
    ) -> Result<RawPrediction, ModelFault>;

    /// Whether concurrent `predict` calls are known to be safe
    fn is_reentrant(&self) -> bool {
        false
    }

    /// Whether the model can still serve calls. A backend hosted in another
    /// process goes away when that process dies.
    fn is_alive(&self) -> bool {
        true
    }

    /// Short human-readable description for logs and health output
    fn describe(&self) -> String;
}

/// Constructs a [`GeoModel`]; construction may be slow and network-bound
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn GeoModel>, ModelFault>;
}
