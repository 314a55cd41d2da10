//! Inference engine module
//!
//! Provides the geolocation inference pipeline stages:
//! - Lazy, process-wide model construction
//! - Image decoding and bounding
//! - Scoped file staging for the path-only model interface
//! - Gradient-free prediction and result normalization
//! - Memory-pressure relief

pub mod cache;
pub mod geoclip;
pub mod model;
pub mod predictor;
pub mod preprocess;
pub mod reclaim;
pub mod staging;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{InferenceSession, ModelCache, ModelHandle};
pub use geoclip::{GeoClipLoader, GeoClipWorker};
pub use model::{GeoModel, ModelLoader, NoGrad, RawPrediction};
pub use predictor::{Prediction, PredictionService};
pub use preprocess::{ImagePreprocessor, InputImage};
pub use reclaim::{HeapTrimReclaimer, NoopReclaimer, ReliefGuard, ResourceReclaimer};
pub use staging::{InferenceStager, StagedFile};
