//! Loaded classifier: network + transform + class registry behind one trait.
//!
//! # Loading
//!
//! | Bundle | Network | Labels | Weights |
//! |--------|---------|--------|---------|
//! | weights mapping | backbone from `architecture` tag + MLP head | metadata / sidecar / placeholders | tolerant, then shape-filtered |
//! | pretrained dir | ViT from `config.json` | `id2label` | complete |
//!
//! In both cases the network is first built against a [`VarMap`] so the
//! checkpoint can be reconciled into it, then rebuilt from detached copies of
//! the reconciled tensors for inference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module};
use candle_nn::{VarBuilder, VarMap};
use image::RgbImage;
use serde::Serialize;

use crate::arch::Backbone;
use crate::checkpoint::{
    open_bundle, read_pretrained_weights, Bundle, Checkpoint, CheckpointFormat,
    PRETRAINED_CONFIG_FILE,
};
use crate::config::ModelConfig;
use crate::device::device_label;
use crate::error::{ModelError, ModelResult};
use crate::labels::{ClassRegistry, ClassSource};
use crate::nn::{BreedClassifierNet, ViTConfig, ViTForImageClassification};
use crate::predict::{probabilities, top_k, Prediction};
use crate::preprocess::{decode_image, ImageTransform, Resize};
use crate::reconcile::{load_complete, log_report, reconcile, LoadReport};

/// Optional file next to a pretrained directory's config.
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

/// Anything that turns an image into a ranked prediction.
///
/// Implementations are immutable after construction and shared across
/// request handlers.
pub trait ImageClassifier: Send + Sync {
    /// Classify a decoded image, returning at most `top_k` ranked labels.
    fn predict(&self, image: &RgbImage, top_k: usize) -> ModelResult<Prediction>;

    /// Describe the loaded model.
    fn info(&self) -> &ModelInfo;

    /// Decode raw upload bytes, then [`predict`](Self::predict).
    fn predict_bytes(&self, bytes: &[u8], top_k: usize) -> ModelResult<Prediction> {
        let image = decode_image(bytes)?;
        self.predict(&image, top_k)
    }
}

/// Which loading path produced the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Checkpoint,
    Pretrained,
}

/// Summary of a loaded classifier, served on `GET /model`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub kind: ModelKind,
    /// Network actually built (`efficientnet_b3`, `resnet50`, `vit`).
    pub architecture: String,
    /// Free-text architecture tag recorded in the checkpoint, if any.
    pub recorded_architecture: Option<String>,
    pub num_classes: usize,
    pub class_source: ClassSource,
    pub classes: Vec<String>,
    /// Validation accuracy recorded by the training run.
    pub accuracy: Option<f64>,
    pub source: PathBuf,
    pub format: CheckpointFormat,
    pub device: String,
    pub load_report: LoadReport,
}

/// Generic implementation of [`ImageClassifier`].
pub struct ClassifierPipeline {
    model: Box<dyn Module + Send + Sync>,
    transform: ImageTransform,
    registry: ClassRegistry,
    device: Device,
    info: ModelInfo,
}

impl ClassifierPipeline {
    /// Assemble a pipeline from an already-loaded network.
    pub fn from_parts(
        model: Box<dyn Module + Send + Sync>,
        transform: ImageTransform,
        registry: ClassRegistry,
        device: Device,
        info: ModelInfo,
    ) -> Self {
        Self {
            model,
            transform,
            registry,
            device,
            info,
        }
    }
}

impl ImageClassifier for ClassifierPipeline {
    fn predict(&self, image: &RgbImage, k: usize) -> ModelResult<Prediction> {
        let input = self.transform.apply(image, &self.device)?;
        let logits = self
            .model
            .forward(&input)
            .map_err(|e| ModelError::Inference {
                message: format!("forward pass failed: {}", e),
            })?;
        let probs = probabilities(&logits)?;
        let prediction = top_k(&probs, k, &self.registry)?;

        tracing::info!(
            "Predicted {} ({:.4}) with {} alternative(s)",
            prediction.label,
            prediction.confidence,
            prediction.alternatives.len()
        );
        Ok(prediction)
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }
}

/// Load the classifier described by `config` onto `device`.
///
/// # Errors
///
/// Missing paths, unrecognized bundles, zero classes and invalid pretrained
/// configs are all fatal; partial weight loads are not.
pub fn load_classifier(config: &ModelConfig, device: &Device) -> ModelResult<ClassifierPipeline> {
    config.validate()?;
    tracing::info!(
        "Loading model from {} on {}",
        config.model_path.display(),
        device_label(device)
    );

    match open_bundle(&config.model_path)? {
        Bundle::Mapping(checkpoint) => load_checkpoint(checkpoint, config, device),
        Bundle::Pretrained(dir) => load_pretrained(&dir, device),
    }
}

/// Build the backbone + head network a checkpoint describes and reconcile
/// its weights into it.
pub fn load_checkpoint(
    checkpoint: Checkpoint,
    config: &ModelConfig,
    device: &Device,
) -> ModelResult<ClassifierPipeline> {
    let registry = ClassRegistry::resolve(
        &checkpoint.metadata,
        config.classes_path.as_deref(),
        config.default_num_classes,
    )?;
    let backbone = Backbone::from_tag(checkpoint.metadata.architecture.as_deref());
    tracing::info!(
        "Building {} with {} classes (labels from {})",
        backbone,
        registry.len(),
        registry.source()
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    // registers every live parameter in the varmap
    BreedClassifierNet::new(backbone, registry.len(), vb)?;
    let report = reconcile(&varmap, &checkpoint.weights)?;

    let model = BreedClassifierNet::new(backbone, registry.len(), frozen(&varmap, device)?)?;

    let info = ModelInfo {
        kind: ModelKind::Checkpoint,
        architecture: backbone.name().to_string(),
        recorded_architecture: checkpoint.metadata.architecture.clone(),
        num_classes: registry.len(),
        class_source: registry.source(),
        classes: registry.names().to_vec(),
        accuracy: checkpoint.metadata.accuracy,
        source: checkpoint.path.clone(),
        format: checkpoint.format,
        device: device_label(device).to_string(),
        load_report: report,
    };
    if let Some(acc) = info.accuracy {
        tracing::info!("Checkpoint reports validation accuracy {:.4}", acc);
    }

    Ok(ClassifierPipeline::from_parts(
        Box::new(model),
        ImageTransform::from_config(&config.preprocess),
        registry,
        device.clone(),
        info,
    ))
}

/// Load a self-describing ViT directory with every parameter required.
pub fn load_pretrained(dir: &Path, device: &Device) -> ModelResult<ClassifierPipeline> {
    let config = ViTConfig::from_file(&dir.join(PRETRAINED_CONFIG_FILE))?;
    let registry = ClassRegistry::new(config.labels(), ClassSource::PretrainedConfig)?;

    let transform = match dir.join(PREPROCESSOR_CONFIG_FILE) {
        path if path.is_file() => ImageTransform::from_preprocessor_config(&path)?,
        _ => ImageTransform::pretrained_default(config.image_size as u32),
    };
    check_input_size(&transform, config.image_size)?;

    let weights = read_pretrained_weights(dir)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    ViTForImageClassification::new(&config, vb)?;
    let report = load_complete(&varmap, &weights)?;
    log_report(&report);

    let model = ViTForImageClassification::new(&config, frozen(&varmap, device)?)?;

    let info = ModelInfo {
        kind: ModelKind::Pretrained,
        architecture: "vit".to_string(),
        recorded_architecture: None,
        num_classes: registry.len(),
        class_source: registry.source(),
        classes: registry.names().to_vec(),
        accuracy: None,
        source: dir.to_path_buf(),
        format: CheckpointFormat::PretrainedDir,
        device: device_label(device).to_string(),
        load_report: report,
    };

    Ok(ClassifierPipeline::from_parts(
        Box::new(model),
        transform,
        registry,
        device.clone(),
        info,
    ))
}

/// Detached copies of every reconciled parameter.
fn frozen(varmap: &VarMap, device: &Device) -> ModelResult<VarBuilder<'static>> {
    let vars = varmap.data().lock().map_err(|_| ModelError::Inference {
        message: "parameter store lock poisoned".to_string(),
    })?;
    let tensors: HashMap<_, _> = vars
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect();
    Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
}

/// The ViT position embeddings fix the input size; reject transforms that
/// would produce anything else.
fn check_input_size(transform: &ImageTransform, image_size: usize) -> ModelResult<()> {
    let output = match (transform.resize(), transform.crop()) {
        (_, Some(crop)) => Some((crop, crop)),
        (Resize::Exact { width, height }, None) => Some((width, height)),
        (Resize::ShorterSide(_), None) => None,
    };
    match output {
        Some((w, h)) if w as usize == image_size && h as usize == image_size => Ok(()),
        Some((w, h)) => Err(ModelError::config(format!(
            "preprocessor produces {}x{} images but the model expects {}x{}",
            w, h, image_size, image_size
        ))),
        None => Err(ModelError::config(
            "preprocessor resizes by shortest edge without a center crop; \
             the model needs a fixed input size",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointMetadata;
    use crate::reconcile::LoadMode;
    use candle_core::{Result, Tensor};
    use candle_nn::Linear;
    use image::Rgb;

    /// Spatial mean followed by a 3 -> n linear layer.
    struct PooledLinear(Linear);

    impl Module for PooledLinear {
        fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            xs.mean((2, 3))?.apply(&self.0)
        }
    }

    fn info(n: usize) -> ModelInfo {
        ModelInfo {
            kind: ModelKind::Checkpoint,
            architecture: "pooled_linear".to_string(),
            recorded_architecture: None,
            num_classes: n,
            class_source: ClassSource::Synthesized,
            classes: Vec::new(),
            accuracy: None,
            source: PathBuf::from("memory"),
            format: CheckpointFormat::SafeTensors,
            device: "cpu".to_string(),
            load_report: LoadReport {
                mode: LoadMode::Tolerant,
                applied: 0,
                missing: Vec::new(),
                unexpected: Vec::new(),
                mismatched: Vec::new(),
            },
        }
    }

    fn tiny_pipeline(num_classes: usize) -> ClassifierPipeline {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = candle_nn::linear(3, num_classes, vb).unwrap();
        ClassifierPipeline::from_parts(
            Box::new(PooledLinear(linear)),
            ImageTransform::new(Resize::ShorterSide(40), Some(32), [0.5; 3], [0.25; 3]),
            ClassRegistry::synthesized(num_classes).unwrap(),
            Device::Cpu,
            info(num_classes),
        )
    }

    #[test]
    fn test_uniform_pixel_prediction_is_a_distribution() {
        let pipeline = tiny_pipeline(5);
        let image = RgbImage::from_pixel(1, 1, Rgb([128, 128, 128]));
        let p = pipeline.predict(&image, 3).unwrap();

        assert!(p.alternatives.len() <= 2);
        assert!(p.label.starts_with("class_"));
        let total: f32 = p.ranked().map(|(_, c)| c).sum();
        assert!(p.ranked().all(|(_, c)| (0.0..=1.0).contains(&c)));
        assert!(total <= 1.0 + 1e-5);
        let confidences: Vec<f32> = p.ranked().map(|(_, c)| c).collect();
        assert!(confidences.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_predict_bytes_rejects_non_images() {
        let pipeline = tiny_pipeline(3);
        let err = pipeline.predict_bytes(b"GIF89a-but-not-really", 3).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_checkpoint_with_mismatched_head_still_loads() {
        // Only the final head layer is supplied, with the wrong class count.
        let mut weights = crate::checkpoint::StateDict::new();
        weights.insert(
            "classifier.12.weight".to_string(),
            Tensor::zeros((30, 256), DType::F32, &Device::Cpu).unwrap(),
        );
        weights.insert(
            "classifier.12.bias".to_string(),
            Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap(),
        );
        let checkpoint = Checkpoint {
            path: PathBuf::from("memory.safetensors"),
            format: CheckpointFormat::SafeTensors,
            weights,
            metadata: CheckpointMetadata {
                class_names: Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
                architecture: Some("EnhancedResnet".into()),
                accuracy: Some(0.9),
                ..Default::default()
            },
            container: Some("model_state_dict"),
        };
        let mut config = ModelConfig::default();
        config.classes_path = None;
        config.preprocess.resize_shorter = 40;
        config.preprocess.crop_size = 32;

        let pipeline = load_checkpoint(checkpoint, &config, &Device::Cpu).unwrap();
        let info = pipeline.info();
        assert_eq!(info.architecture, "resnet50");
        assert_eq!(info.num_classes, 4);
        assert_eq!(info.class_source, ClassSource::Metadata);
        assert_eq!(info.load_report.mode, LoadMode::ShapeFiltered);
        assert_eq!(info.load_report.applied, 1);
        assert_eq!(info.load_report.mismatched[0].name, "classifier.12.weight");

        let p = pipeline
            .predict(&RgbImage::from_pixel(4, 4, Rgb([90, 60, 30])), 3)
            .unwrap();
        assert_eq!(p.alternatives.len(), 2);
    }

    #[test]
    fn test_input_size_check() {
        assert!(check_input_size(&ImageTransform::pretrained_default(224), 224).is_ok());
        assert!(check_input_size(&ImageTransform::pretrained_default(384), 224).is_err());
        let shortest = ImageTransform::new(Resize::ShorterSide(256), None, [0.5; 3], [0.5; 3]);
        assert!(check_input_size(&shortest, 256).is_err());
    }
}
