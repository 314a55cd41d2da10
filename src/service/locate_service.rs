//! Locate Service - Core business logic
//!
//! Orchestrates decode, staging, prediction and cleanup for one uploaded
//! photo, and routes every failure through the error classifier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{
    HeapTrimReclaimer, ImagePreprocessor, InferenceStager, ModelCache, Prediction,
    PredictionService, ReliefGuard, ResourceReclaimer,
};
use crate::error::{classify, PipelineFault, PredictionError, Surface};

use super::map::{MapCollaborator, OsmMarkerBuilder, GUESS_LABEL};
use super::types::*;

/// Blocking half of the service; runs on the blocking thread pool
struct Pipeline {
    cache: Arc<ModelCache>,
    preprocessor: ImagePreprocessor,
    stager: InferenceStager,
    predictor: PredictionService,
    reclaimer: Arc<dyn ResourceReclaimer>,
}

impl Pipeline {
    fn execute(&self, image_data: &[u8], top_k: usize) -> SubmitOutcome {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(Uuid::new_v4().to_string());

        let result = self.run(image_data, top_k, &mut lifecycle);

        let (predictions, error) = match result {
            Ok(predictions) => {
                lifecycle.advance(RequestState::Cleaned);
                (predictions, None)
            }
            Err(fault) => {
                let error = classify(&fault);
                log_failure(lifecycle.request_id(), &error);
                lifecycle.advance(RequestState::Failed(error.kind));
                (Vec::new(), Some(error))
            }
        };

        SubmitOutcome {
            request_id: lifecycle.request_id().to_string(),
            predictions,
            error,
            marker: None,
            lifecycle: lifecycle.into_states(),
            inference_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Decode -> stage -> predict. The staged file is gone and the reclaimer
    /// has run by the time this returns, whatever the result.
    fn run(
        &self,
        image_data: &[u8],
        top_k: usize,
        lifecycle: &mut Lifecycle,
    ) -> Result<Vec<Prediction>, PipelineFault> {
        // Covers decode and model load failures, which return before staging
        let _request_relief = ReliefGuard::new(self.reclaimer.as_ref());

        let image = self.preprocessor.decode_and_normalize(image_data)?;
        lifecycle.advance(RequestState::Decoded);

        let handle = self.cache.get_or_create()?;

        let staged = {
            let _relief = ReliefGuard::new(self.reclaimer.as_ref());
            self.stager.stage(image)
        }?;
        debug!(
            "[{}] Staged {} bytes at {:?}",
            lifecycle.request_id(),
            staged.len(),
            staged.path()
        );
        lifecycle.advance(RequestState::Staged);

        let _relief = ReliefGuard::new(self.reclaimer.as_ref());
        let predicted = self.predictor.predict(&staged, top_k, &handle);
        drop(staged);

        let predictions = predicted?;
        lifecycle.advance(RequestState::Predicted);
        Ok(predictions)
    }
}

fn log_failure(request_id: &str, error: &PredictionError) {
    match error.surface {
        Surface::Inline => warn!("[{}] Rejected upload: {}", request_id, error),
        Surface::PageBlocking | Surface::Operator => error!("[{}] {}", request_id, error),
        Surface::Raw => error!("[{}] Unclassified failure: {}", request_id, error),
    }
}

/// Photo geolocation service
pub struct LocateService {
    pipeline: Arc<Pipeline>,
    map: Arc<dyn MapCollaborator>,
    stats: Mutex<ServiceStats>,
    config: Config,
}

impl LocateService {
    /// Create a new locate service around a shared model cache
    pub fn new(cache: Arc<ModelCache>, config: Config) -> Self {
        Self::with_collaborators(
            cache,
            config,
            Arc::new(HeapTrimReclaimer::default()),
            Arc::new(OsmMarkerBuilder::default()),
        )
    }

    pub fn with_collaborators(
        cache: Arc<ModelCache>,
        config: Config,
        reclaimer: Arc<dyn ResourceReclaimer>,
        map: Arc<dyn MapCollaborator>,
    ) -> Self {
        let pipeline = Pipeline {
            cache,
            preprocessor: ImagePreprocessor::new(&config.preprocess),
            stager: InferenceStager::new(&config.staging),
            predictor: PredictionService::new(),
            reclaimer,
        };

        Self {
            pipeline: Arc::new(pipeline),
            map,
            stats: Mutex::new(ServiceStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Clamp a requested `top_k` into `1..=max_top_k`
    pub fn effective_top_k(&self, top_k: Option<usize>) -> usize {
        top_k
            .unwrap_or(self.config.inference.default_top_k)
            .clamp(1, self.config.inference.max_top_k.max(1))
    }

    /// Locate a photo. Never fails outright: errors come back classified in the outcome.
    pub async fn submit(&self, image_data: Vec<u8>, top_k: Option<usize>) -> SubmitOutcome {
        let top_k = self.effective_top_k(top_k);
        let pipeline = self.pipeline.clone();

        let outcome = tokio::task::spawn_blocking(move || pipeline.execute(&image_data, top_k))
            .await
            .unwrap_or_else(|e| panicked_outcome(e.to_string()));

        self.finish(outcome)
    }

    /// Same as [`LocateService::submit`] for callers already off the async runtime
    pub fn submit_blocking(&self, image_data: &[u8], top_k: Option<usize>) -> SubmitOutcome {
        let top_k = self.effective_top_k(top_k);
        let outcome = self.pipeline.execute(image_data, top_k);
        self.finish(outcome)
    }

    fn finish(&self, mut outcome: SubmitOutcome) -> SubmitOutcome {
        if let Some(best) = outcome.best() {
            let marker = self.map.place_marker(best.latitude, best.longitude, GUESS_LABEL);
            info!(
                "[{}] {} ({} candidates, {}ms)",
                outcome.request_id,
                marker.caption,
                outcome.predictions.len(),
                outcome.inference_time_ms
            );
            outcome.marker = Some(marker);
        }
        self.stats.lock().record(&outcome);
        outcome
    }

    /// Construct the model ahead of the first request; returns how long construction took
    pub async fn warm_up(&self) -> Result<Duration, PredictionError> {
        let cache = self.pipeline.cache.clone();
        tokio::task::spawn_blocking(move || cache.get_or_create().map(|handle| handle.load_time()))
            .await
            .map_err(|e| PipelineFault::Panicked(e.to_string()))
            .and_then(|r| r)
            .map_err(|fault| classify(&fault))
    }

    /// Get health status
    pub fn health(&self) -> HealthResult {
        // Not loaded yet is fine; a model that has gone away is not
        let alive = self.pipeline.cache.model_alive();
        HealthResult {
            healthy: alive != Some(false),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_loaded: self.pipeline.cache.is_loaded() && alive != Some(false),
            model_constructions: self.pipeline.cache.construction_count(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats.lock().clone()
    }
}

fn panicked_outcome(message: String) -> SubmitOutcome {
    let request_id = Uuid::new_v4().to_string();
    let error = classify(&PipelineFault::Panicked(message));
    log_failure(&request_id, &error);
    SubmitOutcome {
        request_id,
        predictions: Vec::new(),
        lifecycle: vec![RequestState::Received, RequestState::Failed(error.kind)],
        error: Some(error),
        marker: None,
        inference_time_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{jpeg_bytes, FakeLoader, FakeModel};
    use crate::engine::NoopReclaimer;
    use crate::error::{ErrorKind, ModelFault};
    use crate::service::map::MapMarker;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct CountingReclaimer(AtomicU64);

    impl ResourceReclaimer for CountingReclaimer {
        fn relieve(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingMap(parking_lot::Mutex<Vec<(f64, f64, String)>>);

    impl MapCollaborator for RecordingMap {
        fn place_marker(&self, latitude: f64, longitude: f64, label: &str) -> MapMarker {
            self.0.lock().push((latitude, longitude, label.to_string()));
            OsmMarkerBuilder::default().place_marker(latitude, longitude, label)
        }
    }

    struct Harness {
        service: LocateService,
        model: Arc<FakeModel>,
        loader: Arc<FakeLoader>,
        reclaimer: Arc<CountingReclaimer>,
        map: Arc<RecordingMap>,
        staging: TempDir,
    }

    impl Harness {
        fn new(model: FakeModel) -> Self {
            Self::with_loader(model, |loader| loader)
        }

        fn with_loader(model: FakeModel, tweak: impl FnOnce(FakeLoader) -> FakeLoader) -> Self {
            let staging = tempdir().unwrap();
            let mut config = Config::default();
            config.staging.dir = Some(staging.path().to_path_buf());

            let model = Arc::new(model);
            let loader = Arc::new(tweak(FakeLoader::new(model.clone())));
            let cache = Arc::new(ModelCache::new(loader.clone(), "cpu", true));
            let reclaimer = Arc::new(CountingReclaimer::default());
            let map = Arc::new(RecordingMap::default());
            let service = LocateService::with_collaborators(
                cache,
                config,
                reclaimer.clone(),
                map.clone(),
            );

            Self {
                service,
                model,
                loader,
                reclaimer,
                map,
                staging,
            }
        }

        fn staged_files_left(&self) -> usize {
            std::fs::read_dir(self.staging.path()).unwrap().count()
        }

        fn seen_paths(&self) -> Vec<PathBuf> {
            self.model.seen().into_iter().map(|(p, _)| p).collect()
        }
    }

    #[tokio::test]
    async fn test_valid_jpeg_yields_one_prediction_and_marker() {
        let h = Harness::new(FakeModel::ranked());

        let outcome = h.service.submit(jpeg_bytes(800, 600), Some(1)).await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.predictions.len(), 1);
        let best = outcome.predictions[0];
        assert!(best.latitude.is_finite() && (-90.0..=90.0).contains(&best.latitude));
        assert!(best.longitude.is_finite() && (-180.0..=180.0).contains(&best.longitude));
        assert!((0.0..=1.0).contains(&best.probability));

        let placed = h.map.0.lock().clone();
        assert_eq!(placed, vec![(best.latitude, best.longitude, GUESS_LABEL.to_string())]);
        assert_eq!(outcome.marker.as_ref().unwrap().latitude, best.latitude);

        assert_eq!(
            outcome.lifecycle,
            vec![
                RequestState::Received,
                RequestState::Decoded,
                RequestState::Staged,
                RequestState::Predicted,
                RequestState::Cleaned,
            ]
        );
    }

    #[tokio::test]
    async fn test_top_k_predictions_are_ranked() {
        let h = Harness::new(FakeModel::ranked());
        let outcome = h.service.submit(jpeg_bytes(64, 64), Some(5)).await;

        assert_eq!(outcome.predictions.len(), 5);
        assert!(outcome
            .predictions
            .windows(2)
            .all(|w| w[0].probability >= w[1].probability));
    }

    #[tokio::test]
    async fn test_staged_file_is_gone_after_success() {
        let h = Harness::new(FakeModel::ranked());
        let outcome = h.service.submit(jpeg_bytes(64, 64), None).await;
        assert!(outcome.is_success());

        let seen = h.model.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1, "staged file must exist during the model call");
        assert!(!seen[0].0.exists());
        assert_eq!(h.staged_files_left(), 0);
    }

    #[tokio::test]
    async fn test_staged_file_is_gone_after_every_inference_error() {
        let faults: Vec<(&'static str, &'static str, ErrorKind)> = vec![
            ("MemoryError", "", ErrorKind::ResourceExhaustion),
            ("TypeError", "predict() got an unexpected keyword argument 'top_k'", ErrorKind::VersionIncompatibility),
            ("ValueError", "something odd", ErrorKind::UnclassifiedFailure),
        ];

        for (error_type, message, kind) in faults {
            let h = Harness::new(FakeModel::failing(error_type, message));
            let outcome = h.service.submit(jpeg_bytes(64, 64), Some(1)).await;

            let error = outcome.error.clone().unwrap();
            assert_eq!(error.kind, kind);
            assert!(outcome.predictions.is_empty());
            assert!(outcome.marker.is_none());
            assert_eq!(outcome.lifecycle.last(), Some(&RequestState::Failed(kind)));

            let paths = h.seen_paths();
            assert_eq!(paths.len(), 1);
            assert!(!paths[0].exists());
            assert_eq!(h.staged_files_left(), 0);
            assert!(h.map.0.lock().is_empty());
        }
    }

    #[tokio::test]
    async fn test_staged_file_is_gone_after_panic_in_model() {
        let h = Harness::new(FakeModel::with(|_: &Path, _| panic!("model crashed")));
        let outcome = h.service.submit(jpeg_bytes(32, 32), Some(1)).await;

        assert_eq!(outcome.error.unwrap().kind, ErrorKind::UnclassifiedFailure);
        let paths = h.seen_paths();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].exists());
        assert_eq!(h.staged_files_left(), 0);
        assert!(h.reclaimer.0.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_interface_shape_fault_is_version_incompatibility() {
        let h = Harness::new(FakeModel::with(|_, _| {
            Err(ModelFault::InterfaceShape("expected 2 outputs, got 1".into()))
        }));
        let outcome = h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ErrorKind::VersionIncompatibility);
        assert_eq!(error.surface, Surface::Operator);
    }

    #[tokio::test]
    async fn test_non_image_bytes_never_reach_the_model() {
        let h = Harness::new(FakeModel::ranked());
        let outcome = h
            .service
            .submit(b"%PDF-1.7 not a picture".to_vec(), Some(1))
            .await;

        assert_eq!(outcome.error.unwrap().kind, ErrorKind::DecodeFailure);
        assert_eq!(h.loader.loads(), 0);
        assert_eq!(h.model.calls(), 0);
        assert_eq!(h.staged_files_left(), 0);
        assert_eq!(
            outcome.lifecycle,
            vec![RequestState::Received, RequestState::Failed(ErrorKind::DecodeFailure)]
        );
        assert!(!h.service.health().model_loaded);
    }

    #[tokio::test]
    async fn test_load_failure_then_recovery() {
        let h = Harness::with_loader(FakeModel::ranked(), |loader| loader.failing(1));

        let first = h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        let error = first.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ModelLoadFailure);
        assert_eq!(error.surface, Surface::PageBlocking);
        assert_eq!(h.staged_files_left(), 0);

        let second = h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        assert!(second.is_success());
        assert_eq!(h.loader.loads(), 2);
        assert_eq!(h.service.health().model_constructions, 2);
    }

    #[tokio::test]
    async fn test_reclaimer_runs_after_staging_and_prediction() {
        let h = Harness::new(FakeModel::ranked());
        h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 3);

        let h = Harness::new(FakeModel::failing("RuntimeError", "boom"));
        h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reclaimer_runs_when_request_fails_before_staging() {
        let h = Harness::with_loader(FakeModel::ranked(), |loader| loader.failing(1));

        let outcome = h.service.submit(b"not an image".to_vec(), Some(1)).await;
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::DecodeFailure);
        assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 1);

        let outcome = h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::ModelLoadFailure);
        assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 2);
        assert_eq!(h.staged_files_left(), 0);
    }

    #[tokio::test]
    async fn test_dead_model_is_unhealthy_and_rebuilt() {
        let h = Harness::new(FakeModel::ranked());
        h.service.warm_up().await.unwrap();
        assert!(h.service.health().healthy);

        h.model.kill();
        let health = h.service.health();
        assert!(!health.healthy);
        assert!(!health.model_loaded);

        // The next request replaces the handle instead of reusing the dead one
        let outcome = h.service.submit(jpeg_bytes(32, 32), Some(1)).await;
        assert!(outcome.is_success());
        assert_eq!(h.loader.loads(), 2);
        assert_eq!(h.service.health().model_constructions, 2);

        h.model.revive();
        assert!(h.service.health().healthy);
        assert!(h.service.health().model_loaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_get_distinct_staged_paths() {
        let h = Arc::new(Harness::new(FakeModel::ranked()));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let h = h.clone();
                tokio::spawn(async move { h.service.submit(jpeg_bytes(16 + i, 16), Some(1)).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_success());
        }

        let paths = h.seen_paths();
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(paths.len(), 50);
        assert_eq!(unique.len(), 50);
        assert_eq!(h.staged_files_left(), 0);
        assert_eq!(h.loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_top_k_is_clamped_and_stats_recorded() {
        let h = Harness::new(FakeModel::ranked());
        assert_eq!(h.service.effective_top_k(Some(0)), 1);
        assert_eq!(h.service.effective_top_k(Some(10_000)), 100);
        assert_eq!(h.service.effective_top_k(None), 1);

        h.service.submit(jpeg_bytes(16, 16), None).await;
        h.service.submit(Vec::new(), None).await;
        let stats = h.service.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures[&ErrorKind::DecodeFailure], 1);
    }

    #[tokio::test]
    async fn test_warm_up_constructs_once() {
        let h = Harness::new(FakeModel::ranked());
        h.service.warm_up().await.unwrap();
        let again = h.service.warm_up().await.unwrap();
        assert_eq!(again, h.service.warm_up().await.unwrap());
        assert!(h.service.health().model_loaded);
        assert_eq!(h.loader.loads(), 1);
    }

    #[test]
    fn test_submit_blocking_matches_async_path() {
        let staging = tempdir().unwrap();
        let mut config = Config::default();
        config.staging.dir = Some(staging.path().to_path_buf());
        let loader = Arc::new(FakeLoader::new(Arc::new(FakeModel::ranked())));
        let service = LocateService::with_collaborators(
            Arc::new(ModelCache::new(loader, "cpu", true)),
            config,
            Arc::new(NoopReclaimer),
            Arc::new(OsmMarkerBuilder::default()),
        );

        let outcome = service.submit_blocking(&jpeg_bytes(40, 40), Some(3));
        assert_eq!(outcome.predictions.len(), 3);
        assert_eq!(outcome.marker.unwrap().label, GUESS_LABEL);
    }
}
