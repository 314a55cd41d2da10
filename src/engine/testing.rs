//! Scripted model doubles shared by the unit tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::engine::model::{grad_enabled, GeoModel, ModelLoader, NoGrad, RawPrediction};
use crate::error::ModelFault;

type Behavior = Box<dyn Fn(&Path, usize) -> Result<RawPrediction, ModelFault> + Send + Sync>;

/// Fake model that records every call it receives
pub struct FakeModel {
    behavior: Behavior,
    calls: AtomicUsize,
    grad_enabled_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
    alive: AtomicBool,
    seen: Mutex<Vec<(PathBuf, bool)>>,
}

impl FakeModel {
    pub fn with(
        behavior: impl Fn(&Path, usize) -> Result<RawPrediction, ModelFault> + Send + Sync + 'static,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
            calls: AtomicUsize::new(0),
            grad_enabled_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            latency: Duration::ZERO,
            alive: AtomicBool::new(true),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Hold every call for `latency` so overlapping calls become visible
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulate the backing process dying
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Most calls observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Returns `top_k` candidates around Paris, best first
    pub fn ranked() -> Self {
        Self::with(|_, top_k| {
            let pairs: Vec<(f64, f64)> = (0..top_k)
                .map(|i| (48.8566 - i as f64 * 0.5, 2.3522 + i as f64 * 0.5))
                .collect();
            let probs: Vec<f64> = (0..top_k).map(|i| 0.6 / (i as f64 + 1.0)).collect();
            Ok(RawPrediction::from_pairs(&pairs, &probs))
        })
    }

    pub fn failing(error_type: &'static str, message: &'static str) -> Self {
        Self::with(move |_, _| {
            Err(ModelFault::Raised {
                error_type: error_type.to_string(),
                message: message.to_string(),
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn grad_enabled_calls(&self) -> usize {
        self.grad_enabled_calls.load(Ordering::SeqCst)
    }

    /// Paths passed to `predict`, with whether each existed at call time
    pub fn seen(&self) -> Vec<(PathBuf, bool)> {
        self.seen.lock().clone()
    }
}

impl GeoModel for FakeModel {
    fn predict(
        &self,
        image_path: &Path,
        top_k: usize,
        scope: &NoGrad,
    ) -> Result<RawPrediction, ModelFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if scope.grad_enabled() || grad_enabled() {
            self.grad_enabled_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.seen
            .lock()
            .push((image_path.to_path_buf(), image_path.exists()));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let result = (self.behavior)(image_path, top_k);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "fake-geomodel".to_string()
    }
}

/// Loader that hands out one shared [`FakeModel`], optionally failing first
pub struct FakeLoader {
    model: Arc<FakeModel>,
    failures_left: AtomicUsize,
    loads: AtomicUsize,
    delay: Duration,
}

impl FakeLoader {
    pub fn new(model: Arc<FakeModel>) -> Self {
        Self {
            model,
            failures_left: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self) -> Result<Arc<dyn GeoModel>, ModelFault> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(ModelFault::Raised {
                error_type: "OSError".to_string(),
                message: "weights download interrupted".to_string(),
            });
        }
        Ok(self.model.clone())
    }
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
}

/// A gradient-filled JPEG of the given size
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg)
}

/// A semi-transparent RGBA PNG of the given size
pub fn rgba_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([20, 120, 220, 90]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

/// A grayscale PNG of the given size
pub fn gray_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::GrayImage::from_pixel(width, height, image::Luma([77]));
    encode(DynamicImage::ImageLuma8(img), ImageFormat::Png)
}

/// A 4x2 palette PNG alternating red and blue columns
pub fn indexed_png_bytes() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
        0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x02, 0x08, 0x03, 0x00, 0x00, 0x00, 0x48, 0x76, 0x8d,
        0x51, 0x00, 0x00, 0x00, 0x06, 0x50, 0x4c, 0x54, 0x45, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0x6c,
        0xa1, 0xfd, 0x8e, 0x00, 0x00, 0x00, 0x0e, 0x49, 0x44, 0x41, 0x54, 0x78, 0xda, 0x63, 0x60, 0x60,
        0x04, 0x42, 0x10, 0x01, 0x00, 0x00, 0x1c, 0x00, 0x05, 0xe4, 0xde, 0x83, 0x2e, 0x00, 0x00, 0x00,
        0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
    ]
}
