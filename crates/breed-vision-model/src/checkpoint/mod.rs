//! Checkpoint bundles: format detection, parsing and key normalization.
//!
//! A bundle is either a weights mapping (PyTorch archive or safetensors file,
//! possibly nested under a container key and possibly carrying the
//! data-parallel `module.` prefix) or a self-describing pretrained directory.

mod format;
mod keys;
mod metadata;
mod pytorch;
mod safetensors_file;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;

use crate::error::{ModelError, ModelResult};

pub use format::CheckpointFormat;
pub use keys::{
    extract_flattened_container, strip_distributed_prefix, CONTAINER_KEYS, DISTRIBUTED_PREFIX,
};
pub use metadata::{
    CheckpointMetadata, ACCURACY_KEY, ARCHITECTURE_KEY, CLASS_NAMES_KEY, NUM_CLASSES_KEY,
};

/// Parameter name -> tensor.
pub type StateDict = HashMap<String, Tensor>;

/// Files a pretrained directory must contain: the config plus one of the
/// weight files, safetensors preferred.
pub const PRETRAINED_CONFIG_FILE: &str = "config.json";
pub const PRETRAINED_WEIGHTS_FILE: &str = "model.safetensors";
pub const PRETRAINED_TORCH_WEIGHTS_FILE: &str = "pytorch_model.bin";

/// A weights mapping read from disk, names already normalized.
#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub format: CheckpointFormat,
    pub weights: StateDict,
    pub metadata: CheckpointMetadata,
    /// Container key the weights were nested under, if any.
    pub container: Option<&'static str>,
}

/// What a bundle turned out to be.
#[derive(Debug)]
pub enum Bundle {
    /// Weights mapping for a network built from the checkpoint description.
    Mapping(Checkpoint),
    /// Complete model directory, used as-is.
    Pretrained(PathBuf),
}

/// Open a bundle and classify it.
///
/// # Errors
///
/// - `CheckpointNotFound` if `path` does not exist
/// - `UnsupportedBundle` for unknown extensions, incomplete pretrained
///   directories and pickled objects that are not mappings
/// - `CheckpointRead` if the file is corrupt
pub fn open_bundle(path: &Path) -> ModelResult<Bundle> {
    let shown = path.display().to_string();
    if !path.exists() {
        return Err(ModelError::CheckpointNotFound { path: shown });
    }

    let format = CheckpointFormat::from_path(path).ok_or_else(|| ModelError::UnsupportedBundle {
        path: shown.clone(),
        reason: "expected .pth, .pt, .ckpt, .bin, .safetensors or a pretrained model directory"
            .to_string(),
    })?;

    let checkpoint = match format {
        CheckpointFormat::PretrainedDir => {
            if !path.join(PRETRAINED_CONFIG_FILE).is_file() {
                return Err(ModelError::UnsupportedBundle {
                    path: shown,
                    reason: format!("directory has no {}", PRETRAINED_CONFIG_FILE),
                });
            }
            if pretrained_weights_file(path).is_none() {
                return Err(ModelError::UnsupportedBundle {
                    path: shown,
                    reason: format!(
                        "directory has neither {} nor {}",
                        PRETRAINED_WEIGHTS_FILE, PRETRAINED_TORCH_WEIGHTS_FILE
                    ),
                });
            }
            tracing::info!("Using complete pretrained model at {}", shown);
            return Ok(Bundle::Pretrained(path.to_path_buf()));
        }
        CheckpointFormat::PyTorch => {
            let contents = pytorch::read_pytorch(path)?;
            Checkpoint {
                path: path.to_path_buf(),
                format,
                weights: strip_distributed_prefix(contents.weights),
                metadata: contents.metadata,
                container: contents.container,
            }
        }
        CheckpointFormat::SafeTensors => {
            let (weights, metadata) = safetensors_file::read_safetensors(path)?;
            let (weights, container) = extract_flattened_container(weights);
            Checkpoint {
                path: path.to_path_buf(),
                format,
                weights: strip_distributed_prefix(weights),
                metadata,
                container,
            }
        }
    };

    tracing::info!(
        "Read {} checkpoint {}: {} tensors (container: {})",
        checkpoint.format,
        shown,
        checkpoint.weights.len(),
        checkpoint.container.unwrap_or("<root>")
    );
    Ok(Bundle::Mapping(checkpoint))
}

fn pretrained_weights_file(dir: &Path) -> Option<PathBuf> {
    [PRETRAINED_WEIGHTS_FILE, PRETRAINED_TORCH_WEIGHTS_FILE]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Read the weights of a pretrained directory onto the CPU.
///
/// # Errors
///
/// - `UnsupportedBundle` if the directory holds no weight file
/// - `CheckpointRead` if the weight file is corrupt
pub fn read_pretrained_weights(dir: &Path) -> ModelResult<StateDict> {
    let path = pretrained_weights_file(dir).ok_or_else(|| ModelError::UnsupportedBundle {
        path: dir.display().to_string(),
        reason: format!(
            "directory has neither {} nor {}",
            PRETRAINED_WEIGHTS_FILE, PRETRAINED_TORCH_WEIGHTS_FILE
        ),
    })?;

    let weights = if path.ends_with(PRETRAINED_WEIGHTS_FILE) {
        candle_core::safetensors::load(&path, &candle_core::Device::Cpu)
            .map_err(|e| ModelError::read(path.display().to_string(), e))?
    } else {
        pytorch::read_pytorch(&path)?.weights
    };
    tracing::debug!("Read {} pretrained tensors from {}", weights.len(), path.display());
    Ok(strip_distributed_prefix(weights))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_not_found() {
        let err = open_bundle(Path::new("/nonexistent/final.pth")).unwrap_err();
        assert!(matches!(err, ModelError::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"onnx").unwrap();

        let err = open_bundle(&path).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedBundle { .. }));
        assert!(err.to_string().contains(".safetensors"));
    }

    #[test]
    fn test_incomplete_pretrained_dir_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();

        let err = open_bundle(dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("model.safetensors"));
        assert!(msg.contains("pytorch_model.bin"));
    }

    #[test]
    fn test_torch_weights_satisfy_pretrained_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();

        assert!(matches!(
            open_bundle(dir.path()).unwrap(),
            Bundle::Pretrained(_)
        ));
        assert_eq!(
            pretrained_weights_file(dir.path()),
            Some(dir.path().join("pytorch_model.bin"))
        );

        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        assert_eq!(
            pretrained_weights_file(dir.path()),
            Some(dir.path().join("model.safetensors"))
        );
    }

    #[test]
    fn test_pretrained_dir_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

        match open_bundle(dir.path()).unwrap() {
            Bundle::Pretrained(p) => assert_eq!(p, dir.path()),
            other => panic!("expected pretrained bundle, got {:?}", other),
        }
    }
}
