//! Reader for single-file safetensors checkpoints.

use std::path::Path;

use candle_core::Device;
use safetensors::SafeTensors;

use super::{CheckpointMetadata, StateDict};
use crate::error::{ModelError, ModelResult};

/// Read every tensor (onto the CPU) plus the `__metadata__` header map.
pub(crate) fn read_safetensors(path: &Path) -> ModelResult<(StateDict, CheckpointMetadata)> {
    let shown = path.display().to_string();
    let buffer = std::fs::read(path)?;

    let (_, header) =
        SafeTensors::read_metadata(&buffer).map_err(|e| ModelError::read(&shown, e))?;
    let metadata = header
        .metadata()
        .as_ref()
        .map(CheckpointMetadata::from_string_map)
        .unwrap_or_default();

    let weights = candle_core::safetensors::load_buffer(&buffer, &Device::Cpu)
        .map_err(|e| ModelError::read(&shown, e))?;

    tracing::debug!(
        "Read {} tensors from {} (metadata present: {})",
        weights.len(),
        shown,
        !metadata.is_empty()
    );

    Ok((weights, metadata))
}
