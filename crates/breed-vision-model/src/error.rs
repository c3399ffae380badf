//! Error type for checkpoint loading and inference failures.
//!
//! # Error Categories
//!
//! | Category | Variants | Surfaced as |
//! |----------|----------|-------------|
//! | Checkpoint | CheckpointNotFound, CheckpointRead, UnsupportedBundle | Fatal at startup |
//! | Weights | ShapeMismatch | Triggers shape-filtered fallback |
//! | Configuration | ConfigError | Fatal at startup |
//! | Input | InvalidImage, EmptyInput | Client error (400) |
//! | Inference | Inference, Tensor | Server error (500) |
//! | Infrastructure | DeviceError, IoError | Fatal at startup |

use serde::Serialize;
use thiserror::Error;

/// Error type for every operation of the model wrapper.
#[derive(Debug, Error)]
pub enum ModelError {
    // === Checkpoint Errors ===
    /// Checkpoint file or pretrained directory does not exist.
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    /// Bundle exists but could not be parsed (corrupt archive, bad header).
    #[error("Failed to read checkpoint {path}: {message}")]
    CheckpointRead { path: String, message: String },

    /// Bundle was readable but is neither a weights mapping nor a complete model.
    #[error("Unrecognized checkpoint format for {path}: {reason}")]
    UnsupportedBundle { path: String, reason: String },

    // === Weight Errors ===
    /// One or more shared parameters disagree on shape.
    #[error("Shape mismatch for {} parameter(s): {}", mismatches.len(), format_mismatches(mismatches))]
    ShapeMismatch { mismatches: Vec<ShapeMismatchEntry> },

    // === Configuration Errors ===
    /// Configuration file invalid or inconsistent.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    // === Input Errors ===
    /// Uploaded bytes are not a decodable image.
    #[error("Could not read image file: {reason}")]
    InvalidImage { reason: String },

    /// Empty input provided.
    #[error("Empty input not allowed")]
    EmptyInput,

    // === Inference Errors ===
    /// Forward pass or post-processing failed.
    #[error("Prediction failed: {message}")]
    Inference { message: String },

    /// Raw tensor library failure.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    // === Infrastructure Errors ===
    /// Compute device could not be initialized.
    #[error("Device error: {message}")]
    DeviceError { message: String },

    /// File I/O error (sidecar files, configs).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A single parameter whose stored shape disagrees with the live network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeMismatchEntry {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

fn format_mismatches(mismatches: &[ShapeMismatchEntry]) -> String {
    mismatches
        .iter()
        .map(|m| format!("{} (expected {:?}, got {:?})", m.name, m.expected, m.actual))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ModelError {
    /// Whether the failure was caused by the caller's input rather than the model.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidImage { .. } | Self::EmptyInput)
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Prefix a configuration message with its TOML section; other errors pass through.
    pub(crate) fn in_section(self, section: &str) -> Self {
        match self {
            Self::ConfigError { message } => Self::config(format!("[{}] {}", section, message)),
            other => other,
        }
    }

    pub(crate) fn read(path: impl Into<String>, message: impl ToString) -> Self {
        Self::CheckpointRead {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;
