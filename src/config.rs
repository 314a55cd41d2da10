//! Geolocation service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub rest_port: u16,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: String,
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Serialize model calls even if the backend claims to be reentrant
    pub serialize_calls: bool,
    /// Construct the model at startup instead of on the first request
    pub preload: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub python: String,
    pub worker_script: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Ceiling for the longer image side
    pub max_dimension: u32,
    pub apply_exif_orientation: bool,
    /// Decoder allocation limit
    pub max_decode_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Defaults to the OS temp directory
    pub dir: Option<PathBuf>,
    pub prefix: String,
    pub jpeg_quality: u8,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    /// Config path from `GEOLOCATE_CONFIG`, falling back to [`Config::default_path`]
    pub fn resolve_path() -> String {
        std::env::var("GEOLOCATE_CONFIG").unwrap_or_else(|_| Self::default_path().to_string())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let inference = &self.inference;
        if inference.default_top_k == 0 || inference.default_top_k > inference.max_top_k {
            anyhow::bail!(
                "inference.default_top_k must be between 1 and max_top_k ({}), got {}",
                inference.max_top_k,
                inference.default_top_k
            );
        }
        if !inference.device.eq_ignore_ascii_case("cpu") {
            anyhow::bail!("inference.device must be \"cpu\", got {:?}", inference.device);
        }
        if self.preprocess.max_dimension == 0 {
            anyhow::bail!("preprocess.max_dimension must be positive");
        }
        if !(1..=100).contains(&self.staging.jpeg_quality) {
            anyhow::bail!(
                "staging.jpeg_quality must be within 1..=100, got {}",
                self.staging.jpeg_quality
            );
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rest_port: 8080,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            default_top_k: 1,
            max_top_k: 100,
            serialize_calls: true,
            preload: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            worker_script: PathBuf::from("scripts/geoclip_worker.py"),
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_dimension: 500,
            apply_exif_orientation: true,
            max_decode_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: "geolocate".to_string(),
            jpeg_quality: 90,
        }
    }
}
