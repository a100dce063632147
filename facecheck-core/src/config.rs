use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub normalize: NormalizeConfig,
    pub detection: DetectionConfig,
    pub encoding: EncodingConfig,
    pub matching: MatchingConfig,
    pub cache: CacheConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality of the copy handed to the media store.
    pub jpeg_quality: u8,
    /// Crop the exported copy to the selected face region.
    pub crop_export_to_face: bool,
}

/// Speed/accuracy trade-off of the face detector, fixed per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorProfile {
    Fast,
    Accurate,
}

impl DetectorProfile {
    /// Square input edge fed to the detector network.
    pub fn input_size(self) -> u32 {
        match self {
            DetectorProfile::Fast => 320,
            DetectorProfile::Accurate => 640,
        }
    }
}

/// Which region wins when the locator reports several faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    First,
    Largest,
    MostCentral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub profile: DetectorProfile,
    pub selection: SelectionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub model_path: PathBuf,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Maximum Euclidean distance accepted as a match.
    pub tolerance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub intra_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub identity_dir: PathBuf,
    pub media_dir: PathBuf,
    pub checkin_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub save_visualizations: bool,
    pub output_dir: PathBuf,
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. /etc/facecheck/facecheck.toml (system-wide)
    /// 2. ~/.config/facecheck/facecheck.toml (user)
    /// 3. Compiled defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(config) = Self::load_from_path("/etc/facecheck/facecheck.toml") {
            config.validate()?;
            return Ok(config);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("facecheck")
                .join("facecheck.toml");
            if let Ok(config) = Self::load_from_path(&user_config) {
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from an explicit file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.normalize.max_width == 0 || self.normalize.max_height == 0 {
            return Err(ConfigError::Validation(
                "Normalization bounds must be non-zero".to_string(),
            ));
        }

        if !(1..=100).contains(&self.normalize.jpeg_quality) {
            return Err(ConfigError::Validation(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::Validation(
                "Detection confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.nms_threshold) {
            return Err(ConfigError::Validation(
                "NMS threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.encoding.dimension == 0 {
            return Err(ConfigError::Validation(
                "Encoding dimension must be greater than 0".to_string(),
            ));
        }

        if !self.matching.tolerance.is_finite() || self.matching.tolerance < 0.0 {
            return Err(ConfigError::Validation(
                "Matching tolerance must be a finite, non-negative number".to_string(),
            ));
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::Validation(
                "Cache capacity must be greater than 0".to_string(),
            ));
        }

        if self.runtime.intra_threads == 0 {
            return Err(ConfigError::Validation(
                "Runtime intra_threads must be greater than 0".to_string(),
            ));
        }

        for (name, path) in [
            ("identity_dir", &self.storage.identity_dir),
            ("media_dir", &self.storage.media_dir),
            ("checkin_log", &self.storage.checkin_log),
            ("debug output_dir", &self.debug.output_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Storage path {} cannot be empty",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_width: 480,
            max_height: 480,
            jpeg_quality: 75,
            crop_export_to_face: false,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/scrfd_500m.onnx"),
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            profile: DetectorProfile::Fast,
            selection: SelectionPolicy::First,
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/face_encoder.onnx"),
            dimension: 128,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { tolerance: 0.6 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { intra_threads: 2 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            identity_dir: PathBuf::from("/var/lib/facecheck/identities"),
            media_dir: PathBuf::from("/var/lib/facecheck/media"),
            checkin_log: PathBuf::from("/var/lib/facecheck/checkins.jsonl"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            save_visualizations: false,
            output_dir: PathBuf::from("~/.cache/facecheck/debug"),
        }
    }
}
