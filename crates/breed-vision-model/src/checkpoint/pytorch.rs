//! Reader for `torch.save` zip archives.
//!
//! The pickled top-level object is parsed with candle's pickle machine so the
//! scalar metadata next to the weights can be recovered; tensors themselves
//! are materialized through [`PthTensors`] under the selected container key.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use candle_core::pickle::{Object, PthTensors, Stack};

use super::keys::CONTAINER_KEYS;
use super::metadata::{ACCURACY_KEY, ARCHITECTURE_KEY, CLASS_NAMES_KEY, NUM_CLASSES_KEY};
use super::{CheckpointMetadata, StateDict};
use crate::error::{ModelError, ModelResult};

/// Weights, metadata and the container key the weights were found under.
pub(crate) struct PytorchContents {
    pub weights: StateDict,
    pub metadata: CheckpointMetadata,
    pub container: Option<&'static str>,
}

pub(crate) fn read_pytorch(path: &Path) -> ModelResult<PytorchContents> {
    let shown = path.display().to_string();
    let top_level = read_top_level(path)?;

    let entries = match &top_level {
        Object::Dict(entries) => entries,
        other => {
            return Err(ModelError::UnsupportedBundle {
                path: shown,
                reason: format!(
                    "expected a dict or state_dict, found {}; a pickled module cannot be \
                     rebuilt outside Python, save `model.state_dict()` instead",
                    describe(other)
                ),
            });
        }
    };

    let metadata = metadata_from_entries(entries);
    let container = CONTAINER_KEYS.into_iter().find(|key| {
        entries
            .iter()
            .any(|(k, v)| as_str(k) == Some(*key) && is_mapping(v))
    });

    tracing::debug!(
        "PyTorch archive {}: {} top-level entries, container={:?}",
        shown,
        entries.len(),
        container
    );

    let pth = PthTensors::new(path, container).map_err(|e| ModelError::read(&shown, e))?;
    let mut weights = StateDict::new();
    for name in pth.tensor_infos().keys() {
        if let Some(tensor) = pth.get(name).map_err(|e| ModelError::read(&shown, e))? {
            weights.insert(name.clone(), tensor);
        }
    }

    Ok(PytorchContents {
        weights,
        metadata,
        container,
    })
}

fn read_top_level(path: &Path) -> ModelResult<Object> {
    let shown = path.display().to_string();
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| ModelError::read(&shown, format!("not a torch.save zip archive: {}", e)))?;

    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| ModelError::read(&shown, "archive has no data.pkl entry"))?;

    let entry = archive
        .by_name(&pickle_name)
        .map_err(|e| ModelError::read(&shown, e))?;
    let mut reader = BufReader::new(entry);
    let mut stack = Stack::empty();
    stack
        .read_loop(&mut reader)
        .map_err(|e| ModelError::read(&shown, e))?;
    stack.finalize().map_err(|e| ModelError::read(&shown, e))
}

fn as_str(obj: &Object) -> Option<&str> {
    match obj {
        Object::Unicode(s) => Some(s.as_str()),
        _ => None,
    }
}

fn is_mapping(obj: &Object) -> bool {
    match obj {
        Object::Dict(_) => true,
        Object::Reduce { callable, .. } => matches!(
            callable.as_ref(),
            Object::Class { module_name, class_name }
                if module_name == "collections" && class_name == "OrderedDict"
        ),
        _ => false,
    }
}

fn metadata_from_entries(entries: &[(Object, Object)]) -> CheckpointMetadata {
    let mut meta = CheckpointMetadata::default();
    for (key, value) in entries {
        match as_str(key) {
            Some(CLASS_NAMES_KEY) => meta.class_names = string_list(value),
            Some(NUM_CLASSES_KEY) => {
                meta.num_classes = match value {
                    Object::Int(n) if *n >= 0 => Some(*n as usize),
                    _ => None,
                }
            }
            Some(ARCHITECTURE_KEY) => meta.architecture = as_str(value).map(str::to_string),
            Some(ACCURACY_KEY) => {
                meta.accuracy = match value {
                    Object::Float(f) => Some(*f),
                    Object::Int(n) => Some(f64::from(*n)),
                    // numpy scalars pickle as reduce calls
                    _ => None,
                }
            }
            _ => {}
        }
    }
    meta
}

fn string_list(obj: &Object) -> Option<Vec<String>> {
    match obj {
        Object::List(items) | Object::Tuple(items) => items
            .iter()
            .map(|item| as_str(item).map(str::to_string))
            .collect(),
        _ => None,
    }
}

fn describe(obj: &Object) -> String {
    match obj {
        Object::Build { callable, .. } | Object::Reduce { callable, .. } => {
            match callable.as_ref() {
                Object::Class {
                    module_name,
                    class_name,
                } => format!("a pickled {}.{} object", module_name, class_name),
                inner => describe(inner),
            }
        }
        Object::Class {
            module_name,
            class_name,
        } => format!("the class {}.{}", module_name, class_name),
        Object::List(_) => "a list".to_string(),
        Object::Tuple(_) => "a tuple".to_string(),
        Object::Unicode(_) => "a string".to_string(),
        Object::Int(_) | Object::Float(_) | Object::Bool(_) => "a scalar".to_string(),
        Object::None => "None".to_string(),
        _ => "an unsupported pickled value".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Object {
        Object::Unicode(v.to_string())
    }

    #[test]
    fn test_metadata_from_training_dict() {
        let entries = vec![
            (s("model_state_dict"), Object::Dict(vec![])),
            (s("class_names"), Object::List(vec![s("Gir"), s("Ongole")])),
            (s("num_classes"), Object::Int(2)),
            (s("accuracy"), Object::Float(0.87)),
            (s("architecture"), s("EnhancedEfficientnet")),
        ];
        let meta = metadata_from_entries(&entries);
        assert_eq!(
            meta.class_names,
            Some(vec!["Gir".to_string(), "Ongole".to_string()])
        );
        assert_eq!(meta.num_classes, Some(2));
        assert_eq!(meta.accuracy, Some(0.87));
        assert_eq!(meta.architecture.as_deref(), Some("EnhancedEfficientnet"));
    }

    #[test]
    fn test_mixed_class_list_is_rejected() {
        let list = Object::List(vec![s("Gir"), Object::Int(3)]);
        assert_eq!(string_list(&list), None);
    }

    #[test]
    fn test_ordered_dict_counts_as_mapping() {
        let ordered = Object::Reduce {
            callable: Box::new(Object::Class {
                module_name: "collections".to_string(),
                class_name: "OrderedDict".to_string(),
            }),
            args: Box::new(Object::Tuple(vec![])),
        };
        assert!(is_mapping(&ordered));
        assert!(is_mapping(&Object::Dict(vec![])));
        assert!(!is_mapping(&s("state_dict")));
    }

    #[test]
    fn test_describe_pickled_module() {
        let module = Object::Build {
            callable: Box::new(Object::Reduce {
                callable: Box::new(Object::Class {
                    module_name: "model".to_string(),
                    class_name: "EnhancedCattleClassifier".to_string(),
                }),
                args: Box::new(Object::Tuple(vec![])),
            }),
            args: Box::new(Object::Dict(vec![])),
        };
        assert_eq!(
            describe(&module),
            "a pickled model.EnhancedCattleClassifier object"
        );
    }

    #[test]
    fn test_non_zip_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pth");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();

        let err = read_pytorch(&path).err().unwrap();
        assert!(matches!(err, ModelError::CheckpointRead { .. }));
        assert!(err.to_string().contains("zip"));
    }
}
