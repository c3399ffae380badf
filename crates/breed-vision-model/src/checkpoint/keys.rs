//! Weight-name normalization.

use super::StateDict;

/// Container keys tried, in priority order, when a bundle nests its weights.
pub const CONTAINER_KEYS: [&str; 2] = ["model_state_dict", "state_dict"];

/// Prefix added to every parameter name by data-parallel training wrappers.
pub const DISTRIBUTED_PREFIX: &str = "module.";

/// Strip the leading data-parallel prefix from every key that carries it.
///
/// Only the leading occurrence is removed; `module.` segments deeper in a
/// name belong to the model itself.
pub fn strip_distributed_prefix(weights: StateDict) -> StateDict {
    let mut stripped = 0usize;
    let normalized: StateDict = weights
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix(DISTRIBUTED_PREFIX) {
            Some(rest) => {
                stripped += 1;
                (rest.to_string(), tensor)
            }
            None => (name, tensor),
        })
        .collect();

    if stripped > 0 {
        tracing::debug!(
            "Stripped '{}' prefix from {} weight name(s)",
            DISTRIBUTED_PREFIX,
            stripped
        );
    }
    normalized
}

/// Pick the nested container out of a flattened mapping.
///
/// Flattened containers appear as `<container>.<param>` names. Returns the
/// mapping below the first container found, or the input unchanged.
pub fn extract_flattened_container(weights: StateDict) -> (StateDict, Option<&'static str>) {
    for key in CONTAINER_KEYS {
        let prefix = format!("{}.", key);
        if weights.keys().any(|name| name.starts_with(&prefix)) {
            let inner = weights
                .into_iter()
                .filter_map(|(name, tensor)| {
                    name.strip_prefix(&prefix)
                        .map(|rest| (rest.to_string(), tensor))
                })
                .collect();
            return (inner, Some(key));
        }
    }
    (weights, None)
}
