//! Backbone selection from the checkpoint's architecture tag.

use std::fmt;

use serde::Serialize;

/// Convolutional feature extractors a checkpoint can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    #[default]
    EfficientNetB3,
    ResNet50,
}

impl Backbone {
    /// Case-insensitive substring match on the free-text tag.
    ///
    /// `resnet` is checked before `efficient`; anything else, including no
    /// tag at all, falls back to EfficientNet-B3.
    pub fn from_tag(tag: Option<&str>) -> Self {
        let Some(tag) = tag else {
            return Self::default();
        };
        let tag = tag.to_lowercase();
        if tag.contains("resnet") {
            Self::ResNet50
        } else if tag.contains("efficient") {
            Self::EfficientNetB3
        } else {
            tracing::warn!(
                "Unrecognized architecture tag '{}'; defaulting to {}",
                tag,
                Self::default()
            );
            Self::default()
        }
    }

    /// Width of the pooled feature vector fed to the head.
    pub const fn feature_dim(&self) -> usize {
        match self {
            Self::EfficientNetB3 => 1536,
            Self::ResNet50 => 2048,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::EfficientNetB3 => "efficientnet_b3",
            Self::ResNet50 => "resnet50",
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
