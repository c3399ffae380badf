//! Optional metadata stored alongside checkpoint weights.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata keys written by the training script.
pub const CLASS_NAMES_KEY: &str = "class_names";
pub const NUM_CLASSES_KEY: &str = "num_classes";
pub const ARCHITECTURE_KEY: &str = "architecture";
pub const ACCURACY_KEY: &str = "accuracy";

/// Metadata recovered from a checkpoint bundle. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub class_names: Option<Vec<String>>,
    pub num_classes: Option<usize>,
    pub architecture: Option<String>,
    pub accuracy: Option<f64>,
}

impl CheckpointMetadata {
    /// Parse the string map of a safetensors header.
    ///
    /// `class_names` is a JSON array; numbers are decimal strings. Values that
    /// fail to parse are dropped with a warning.
    pub fn from_string_map(map: &HashMap<String, String>) -> Self {
        let class_names = map.get(CLASS_NAMES_KEY).and_then(|raw| {
            serde_json::from_str::<Vec<String>>(raw)
                .map_err(|e| tracing::warn!("Ignoring unparsable class_names metadata: {}", e))
                .ok()
        });

        let num_classes = map.get(NUM_CLASSES_KEY).and_then(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|e| tracing::warn!("Ignoring num_classes metadata '{}': {}", raw, e))
                .ok()
        });

        let accuracy = map.get(ACCURACY_KEY).and_then(|raw| {
            raw.trim()
                .parse::<f64>()
                .map_err(|e| tracing::warn!("Ignoring accuracy metadata '{}': {}", raw, e))
                .ok()
        });

        Self {
            class_names,
            num_classes,
            architecture: map.get(ARCHITECTURE_KEY).cloned(),
            accuracy,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.class_names.is_none()
            && self.num_classes.is_none()
            && self.architecture.is_none()
            && self.accuracy.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_string_map() {
        let mut map = HashMap::new();
        map.insert("class_names".to_string(), r#"["Gir","Sahiwal"]"#.to_string());
        map.insert("num_classes".to_string(), "2".to_string());
        map.insert("architecture".to_string(), "EnhancedResnet".to_string());
        map.insert("accuracy".to_string(), "0.9134".to_string());

        let meta = CheckpointMetadata::from_string_map(&map);
        assert_eq!(
            meta.class_names,
            Some(vec!["Gir".to_string(), "Sahiwal".to_string()])
        );
        assert_eq!(meta.num_classes, Some(2));
        assert_eq!(meta.architecture.as_deref(), Some("EnhancedResnet"));
        assert!((meta.accuracy.unwrap() - 0.9134).abs() < 1e-9);
    }

    #[test]
    fn test_bad_values_are_dropped() {
        let mut map = HashMap::new();
        map.insert("class_names".to_string(), "Gir,Sahiwal".to_string());
        map.insert("num_classes".to_string(), "many".to_string());

        let meta = CheckpointMetadata::from_string_map(&map);
        assert!(meta.class_names.is_none());
        assert!(meta.num_classes.is_none());
        assert!(meta.is_empty());
    }
}
