//! Inference staging
//!
//! The geolocation model reads its input from a file path, so every request
//! writes its preprocessed image to a uniquely named temporary file. The file
//! lives exactly as long as the [`StagedFile`] that owns it.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::TempPath;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StagingConfig;
use crate::engine::preprocess::InputImage;
use crate::error::StagingFault;
use crate::utils::image::write_jpeg;

/// A temporary JPEG scoped to one inference call; deleted on drop
#[derive(Debug)]
pub struct StagedFile {
    path: Option<TempPath>,
    bytes: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        // Only `Drop` takes the path out
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Encoded size on disk
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let removed = path.to_path_buf();
            match path.close() {
                Ok(()) => debug!("Removed staged file {:?}", removed),
                Err(e) => warn!("Failed to remove staged file {:?}: {}", removed, e),
            }
        }
    }
}

/// Writes [`InputImage`]s to uniquely named temporary files
#[derive(Debug, Clone)]
pub struct InferenceStager {
    dir: PathBuf,
    prefix: String,
    jpeg_quality: u8,
}

impl InferenceStager {
    pub fn new(config: &StagingConfig) -> Self {
        Self {
            dir: config.dir.clone().unwrap_or_else(std::env::temp_dir),
            prefix: config.prefix.clone(),
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Encode `image` to a fresh temporary file. The image is consumed and
    /// released before this returns.
    pub fn stage(&self, image: InputImage) -> Result<StagedFile, StagingFault> {
        let prefix = format!("{}-{}-{}-", self.prefix, unix_millis(), Uuid::new_v4().simple());
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".jpg")
            .tempfile_in(&self.dir)
            .map_err(|e| StagingFault::new("create", e))?;

        // Anything that fails below drops `path`, which removes the partial write
        let (file, path) = file.into_parts();
        let mut writer = BufWriter::new(file);
        write_jpeg(image.pixels(), &mut writer, self.jpeg_quality)
            .map_err(|e| StagingFault::new("encode", std::io::Error::other(e)))?;
        writer
            .flush()
            .map_err(|e| StagingFault::new("flush", e))?;
        let file = writer
            .into_inner()
            .map_err(|e| StagingFault::new("flush", e.into_error()))?;
        let bytes = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StagingFault::new("stat", e))?;
        drop(file);

        debug!("Staged {:?} ({} bytes)", path, bytes);
        Ok(StagedFile {
            path: Some(path),
            bytes,
        })
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
