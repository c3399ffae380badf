//! Persisted bundle formats.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Supported bundle formats.
///
/// # Example
///
/// ```
/// use breed_vision_model::checkpoint::CheckpointFormat;
///
/// assert_eq!(CheckpointFormat::from_extension("PTH"), Some(CheckpointFormat::PyTorch));
/// assert_eq!(CheckpointFormat::from_extension("xml"), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    /// `torch.save` zip archive holding a pickled object.
    PyTorch,
    /// Single safetensors file; metadata lives in the header.
    SafeTensors,
    /// Directory with `config.json` + `model.safetensors` or `pytorch_model.bin`.
    PretrainedDir,
}

impl CheckpointFormat {
    /// Determines format from file extension.
    ///
    /// - `.pth`, `.pt`, `.ckpt`, `.bin` -> PyTorch
    /// - `.safetensors` -> SafeTensors
    /// - Other -> None
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pth" | "pt" | "ckpt" | "bin" => Some(Self::PyTorch),
            "safetensors" => Some(Self::SafeTensors),
            _ => None,
        }
    }

    /// Determines format from an existing path; directories are pretrained bundles.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::PretrainedDir);
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::PyTorch => "pytorch",
            Self::SafeTensors => "safetensors",
            Self::PretrainedDir => "pretrained_dir",
        }
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
