//! Model loading and preprocessing configuration.
//!
//! Lives under `[model]` / `[model.preprocess]` in the server's TOML file.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DevicePreference;
use crate::error::{ModelError, ModelResult};

/// Environment variable naming the checkpoint bundle.
pub const ENV_MODEL_FILE: &str = "MODEL_FILE";
/// Environment variable naming the class-names sidecar.
pub const ENV_CLASSES_FILE: &str = "CLASSES_FILE";
pub const ENV_TOP_K: &str = "BREED_VISION_TOP_K";
pub const ENV_DEVICE: &str = "BREED_VISION_DEVICE";

// ============================================================================
// PREPROCESS CONFIG
// ============================================================================

/// Fixed transform applied to every uploaded image of a checkpoint model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Target length of the shorter image side after resizing.
    #[serde(default = "default_resize_shorter")]
    pub resize_shorter: u32,

    /// Side of the square center crop taken after resizing.
    #[serde(default = "default_crop_size")]
    pub crop_size: u32,

    /// Per-channel mean subtracted after scaling to [0, 1].
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],

    /// Per-channel standard deviation divided out after the mean.
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_resize_shorter() -> u32 {
    256
}

fn default_crop_size() -> u32 {
    224
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resize_shorter: default_resize_shorter(),
            crop_size: default_crop_size(),
            mean: default_mean(),
            std: default_std(),
        }
    }
}

impl PreprocessConfig {
    /// # Errors
    /// - `ModelError::ConfigError` if a size is 0
    /// - `ModelError::ConfigError` if crop_size > resize_shorter
    /// - `ModelError::ConfigError` if any std entry is not positive
    pub fn validate(&self) -> ModelResult<()> {
        if self.resize_shorter == 0 || self.crop_size == 0 {
            return Err(ModelError::config("resize_shorter and crop_size must be > 0"));
        }
        if self.crop_size > self.resize_shorter {
            return Err(ModelError::config(format!(
                "crop_size ({}) cannot exceed resize_shorter ({})",
                self.crop_size, self.resize_shorter
            )));
        }
        if self.std.iter().any(|s| !(*s > 0.0)) {
            return Err(ModelError::config(format!(
                "std entries must be positive, got {:?}",
                self.std
            )));
        }
        Ok(())
    }
}

// ============================================================================
// MODEL CONFIG
// ============================================================================

/// Where the model comes from and how predictions are produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Checkpoint file (.pth/.pt/.ckpt/.bin/.safetensors) or pretrained directory.
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Optional sidecar with one class label per line.
    #[serde(default = "default_classes_path")]
    pub classes_path: Option<PathBuf>,

    /// Class count used when neither metadata nor sidecar define the labels.
    #[serde(default = "default_num_classes")]
    pub default_num_classes: usize,

    /// Number of ranked labels returned per prediction.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub device: DevicePreference,

    #[serde(default)]
    pub preprocess: PreprocessConfig,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/final_enhanced_cattle_classifier.pth")
}

fn default_classes_path() -> Option<PathBuf> {
    Some(PathBuf::from("models/classes.txt"))
}

fn default_num_classes() -> usize {
    30
}

fn default_top_k() -> usize {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            classes_path: default_classes_path(),
            default_num_classes: default_num_classes(),
            top_k: default_top_k(),
            device: DevicePreference::default(),
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Validate the configuration, returning the first error found.
    pub fn validate(&self) -> ModelResult<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(ModelError::config("model_path cannot be empty"));
        }
        if self.default_num_classes == 0 {
            return Err(ModelError::config("default_num_classes must be > 0"));
        }
        if self.top_k == 0 {
            return Err(ModelError::config("top_k must be > 0"));
        }
        self.preprocess
            .validate()
            .map_err(|e| e.in_section("model.preprocess"))
    }

    /// Apply `MODEL_FILE`, `CLASSES_FILE`, `BREED_VISION_TOP_K` and
    /// `BREED_VISION_DEVICE`. Unparsable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    /// Same as [`with_env_overrides`](Self::with_env_overrides) with a custom lookup.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = lookup(ENV_MODEL_FILE) {
            self.model_path = PathBuf::from(val);
        }
        if let Some(val) = lookup(ENV_CLASSES_FILE) {
            self.classes_path = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup(ENV_TOP_K) {
            match val.parse::<usize>() {
                Ok(n) => self.top_k = n,
                Err(_) => tracing::warn!("Ignoring {}={}: not a number", ENV_TOP_K, val),
            }
        }
        if let Some(val) = lookup(ENV_DEVICE) {
            match val.parse::<DevicePreference>() {
                Ok(pref) => self.device = pref,
                Err(e) => tracing::warn!("Ignoring {}={}: {}", ENV_DEVICE, val, e),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_num_classes, 30);
        assert_eq!(config.top_k, 3);
        assert_eq!(config.preprocess.resize_shorter, 256);
        assert_eq!(config.preprocess.crop_size, 224);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ModelConfig = toml::from_str(
            r#"
            model_path = "weights/resnet.safetensors"
            top_k = 5

            [preprocess]
            crop_size = 200
            "#,
        )
        .unwrap();
        assert_eq!(config.model_path, PathBuf::from("weights/resnet.safetensors"));
        assert_eq!(config.top_k, 5);
        assert_eq!(config.preprocess.crop_size, 200);
        assert_eq!(config.preprocess.resize_shorter, 256);
        assert_eq!(config.device, DevicePreference::Auto);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ModelConfig::default();
        config.top_k = 0;
        assert!(config.validate().unwrap_err().to_string().contains("top_k"));

        let mut config = ModelConfig::default();
        config.preprocess.crop_size = 300;
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("[model.preprocess]"));
        assert!(msg.contains("crop_size"));
        assert_eq!(msg.matches("Configuration error").count(), 1);

        let mut config = ModelConfig::default();
        config.preprocess.std = [0.2, 0.0, 0.2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODEL_FILE", "/srv/model.pth"),
            ("CLASSES_FILE", "/srv/classes.txt"),
            ("BREED_VISION_TOP_K", "five"),
            ("BREED_VISION_DEVICE", "cpu"),
        ]
        .into_iter()
        .collect();

        let config =
            ModelConfig::default().with_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.model_path, PathBuf::from("/srv/model.pth"));
        assert_eq!(config.classes_path, Some(PathBuf::from("/srv/classes.txt")));
        assert_eq!(config.top_k, 3);
        assert_eq!(config.device, DevicePreference::Cpu);
    }
}
