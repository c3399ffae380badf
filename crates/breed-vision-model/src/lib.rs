//! Breed image classifier: checkpoint loading, weight reconciliation and inference.
//!
//! # Architecture
//!
//! ```text
//! bundle on disk ──► checkpoint::open_bundle ──► Bundle::Mapping ──► labels + arch
//!                                          │                             │
//!                                          │                   nn::BreedClassifierNet
//!                                          │                             │
//!                                          │                   reconcile::reconcile
//!                                          └► Bundle::Pretrained ──► nn::ViT (complete load)
//!
//! upload bytes ──► preprocess ──► network ──► predict::top_k ──► Prediction
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use breed_vision_model::{init_device, load_classifier, ImageClassifier, ModelConfig};
//!
//! let config = ModelConfig::default().with_env_overrides();
//! let device = init_device(config.device)?;
//! let classifier = load_classifier(&config, device)?;
//!
//! let bytes = std::fs::read("cow.jpg")?;
//! let prediction = classifier.predict_bytes(&bytes, config.top_k)?;
//! println!("{} ({:.2})", prediction.label, prediction.confidence);
//! # Ok::<(), breed_vision_model::ModelError>(())
//! ```

pub mod arch;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod device;
pub mod error;
pub mod labels;
pub mod nn;
pub mod predict;
pub mod preprocess;
pub mod reconcile;

pub use arch::Backbone;
pub use checkpoint::{open_bundle, Bundle, Checkpoint, CheckpointFormat, CheckpointMetadata};
pub use classifier::{
    load_checkpoint, load_classifier, load_pretrained, ClassifierPipeline, ImageClassifier,
    ModelInfo, ModelKind,
};
pub use config::{ModelConfig, PreprocessConfig};
pub use device::{device_label, init_device, new_device, DevicePreference};
pub use error::{ModelError, ModelResult, ShapeMismatchEntry};
pub use labels::{ClassRegistry, ClassSource};
pub use predict::{Prediction, ScoredLabel};
pub use preprocess::{decode_image, ImageTransform, Resize};
pub use reconcile::{LoadMode, LoadReport};
