//! Class registry: index -> human-readable label.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::checkpoint::CheckpointMetadata;
use crate::error::{ModelError, ModelResult};

/// Where the labels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassSource {
    Metadata,
    Sidecar,
    PretrainedConfig,
    Synthesized,
}

impl fmt::Display for ClassSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Metadata => "checkpoint metadata",
            Self::Sidecar => "classes file",
            Self::PretrainedConfig => "pretrained config",
            Self::Synthesized => "synthesized placeholders",
        };
        f.write_str(s)
    }
}

/// Ordered list of labels; its length is the network's output dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRegistry {
    names: Vec<String>,
    source: ClassSource,
}

impl ClassRegistry {
    pub fn new(names: Vec<String>, source: ClassSource) -> ModelResult<Self> {
        if names.is_empty() {
            return Err(ModelError::config(
                "class registry is empty; the classifier needs at least one class",
            ));
        }
        Ok(Self { names, source })
    }

    /// `class_0 .. class_{count-1}`.
    pub fn synthesized(count: usize) -> ModelResult<Self> {
        Self::new(
            (0..count).map(|i| format!("class_{}", i)).collect(),
            ClassSource::Synthesized,
        )
    }

    /// Resolve labels for a checkpoint.
    ///
    /// Priority: `class_names` metadata, then the sidecar file (one label per
    /// line, blank lines skipped), then placeholders for the metadata
    /// `num_classes` or `default_count`. A `class_names` entry that is present
    /// but empty still rules out the sidecar.
    ///
    /// # Errors
    ///
    /// `ConfigError` when the resolved count is zero; `IoError` when the
    /// sidecar exists but cannot be read.
    pub fn resolve(
        metadata: &CheckpointMetadata,
        sidecar: Option<&Path>,
        default_count: usize,
    ) -> ModelResult<Self> {
        match metadata.class_names.as_ref() {
            Some(names) if !names.is_empty() => {
                if let Some(n) = metadata.num_classes.filter(|n| *n != names.len()) {
                    tracing::warn!(
                        "Checkpoint lists {} class names but num_classes = {}; using the names",
                        names.len(),
                        n
                    );
                }
                return Self::new(names.clone(), ClassSource::Metadata);
            }
            Some(_) => {
                tracing::warn!("Checkpoint has an empty class_names list; using placeholders");
            }
            None => {
                if let Some(names) = sidecar.map(Self::sidecar_names).transpose()?.flatten() {
                    return Self::new(names, ClassSource::Sidecar);
                }
            }
        }

        let count = metadata.num_classes.unwrap_or(default_count);
        if count == 0 {
            return Err(ModelError::config(
                "resolved class count is 0; set num_classes or provide class names",
            ));
        }
        Self::synthesized(count)
    }

    fn sidecar_names(path: &Path) -> ModelResult<Option<Vec<String>>> {
        if !path.is_file() {
            tracing::debug!("No classes file at {}", path.display());
            return Ok(None);
        }
        let names = read_sidecar(path)?;
        if names.is_empty() {
            tracing::warn!("Classes file {} has no labels; ignoring it", path.display());
            return Ok(None);
        }
        Ok(Some(names))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn source(&self) -> ClassSource {
        self.source
    }

    /// Label for `index`, or the index itself in decimal when out of range.
    pub fn label_for(&self, index: usize) -> String {
        self.names
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}

fn read_sidecar(path: &Path) -> ModelResult<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
