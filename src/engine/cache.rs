//! Model Cache
//!
//! Lazily constructs the single shared geolocation model and keeps it for the
//! lifetime of the process. A failed construction is never cached; the next
//! caller starts again from scratch.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::engine::model::{GeoModel, ModelLoader, NoGrad, RawPrediction};
use crate::error::{ModelFault, PipelineFault};

struct LoadedModel {
    model: Arc<dyn GeoModel>,
    device: String,
    serialized: bool,
    gate: Mutex<()>,
    load_time: Duration,
}

/// Shared, immutable reference to the loaded model.
///
/// Clones are cheap and compare equal when they point at the same instance.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<LoadedModel>,
}

impl ModelHandle {
    fn new(model: Arc<dyn GeoModel>, device: &str, serialize_calls: bool, load_time: Duration) -> Self {
        let serialized = serialize_calls || !model.is_reentrant();
        Self {
            inner: Arc::new(LoadedModel {
                model,
                device: device.to_string(),
                serialized,
                gate: Mutex::new(()),
                load_time,
            }),
        }
    }

    /// Open a call-scoped, gradient-free inference session.
    ///
    /// When calls are serialized this blocks until no other session is open.
    pub fn session(&self) -> InferenceSession<'_> {
        let gate = if self.inner.serialized {
            Some(self.inner.gate.lock())
        } else {
            None
        };
        InferenceSession {
            handle: self,
            _gate: gate,
            no_grad: NoGrad::enter(),
        }
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn is_serialized(&self) -> bool {
        self.inner.serialized
    }

    pub fn load_time(&self) -> Duration {
        self.inner.load_time
    }

    pub fn is_alive(&self) -> bool {
        self.inner.model.is_alive()
    }

    pub fn describe(&self) -> String {
        self.inner.model.describe()
    }
}

impl PartialEq for ModelHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ModelHandle {}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.inner.model.describe())
            .field("device", &self.inner.device)
            .field("serialized", &self.inner.serialized)
            .finish()
    }
}

/// Gradient-free scope for a single inference call; released on drop
pub struct InferenceSession<'a> {
    handle: &'a ModelHandle,
    _gate: Option<MutexGuard<'a, ()>>,
    no_grad: NoGrad,
}

impl InferenceSession<'_> {
    pub fn predict(&self, image_path: &Path, top_k: usize) -> Result<RawPrediction, ModelFault> {
        self.handle
            .inner
            .model
            .predict(image_path, top_k, &self.no_grad)
    }
}

/// Process-wide holder of the single model handle
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    device: String,
    serialize_calls: bool,
    slot: RwLock<Option<ModelHandle>>,
    constructions: AtomicUsize,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>, device: &str, serialize_calls: bool) -> Self {
        Self {
            loader,
            device: device.to_string(),
            serialize_calls,
            slot: RwLock::new(None),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Return the shared handle, constructing the model on first use.
    ///
    /// A cached model that is no longer alive is dropped and built again.
    pub fn get_or_create(&self) -> Result<ModelHandle, PipelineFault> {
        let cached = self.slot.read().as_ref().cloned();
        if let Some(handle) = cached {
            if handle.is_alive() {
                return Ok(handle);
            }
        }

        let mut slot = self.slot.write();

        // Double-check: another caller may have finished construction while we waited
        if let Some(handle) = slot.as_ref() {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            warn!("Model {} is no longer running, constructing a new one", handle.describe());
            *slot = None;
        }

        let attempt = self.constructions.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Loading geolocation model on {} (attempt {})", self.device, attempt);
        let start = Instant::now();

        let model = self.loader.load().map_err(|e| {
            warn!("Model construction failed after {:?}: {}", start.elapsed(), e);
            PipelineFault::Load(e)
        })?;

        let elapsed = start.elapsed();
        let handle = ModelHandle::new(model, &self.device, self.serialize_calls, elapsed);
        info!("Model {} loaded in {:?}", handle.describe(), elapsed);

        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Whether a model is resident; false while a construction is in flight
    pub fn is_loaded(&self) -> bool {
        self.slot
            .try_read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Liveness of the resident model; `None` when nothing is loaded or a
    /// construction is in flight
    pub fn model_alive(&self) -> Option<bool> {
        self.slot
            .try_read()
            .and_then(|slot| slot.as_ref().map(ModelHandle::is_alive))
    }

    /// Number of construction attempts made so far
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}
